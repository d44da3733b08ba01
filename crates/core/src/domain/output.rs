//! Composite output identifier
//!
//! Names both the physical routing mode and the filter coefficient set, and
//! is written as `"output:coeff"`.

use crate::domain::error::{PreampError, Violation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputId {
    output: String,
    coefficients: String,
}

impl OutputId {
    pub fn new(output: impl Into<String>, coefficients: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            coefficients: coefficients.into(),
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn coefficients(&self) -> &str {
        &self.coefficients
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.output, self.coefficients)
    }
}

impl FromStr for OutputId {
    type Err = PreampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PreampError::InvalidParameter {
            parameter: "output",
            violation: Violation::Malformed(s.to_string()),
        };

        let (output, coefficients) = s.split_once(':').ok_or_else(malformed)?;
        if output.is_empty() || coefficients.is_empty() || coefficients.contains(':') {
            return Err(malformed());
        }
        Ok(Self::new(output, coefficients))
    }
}

impl TryFrom<String> for OutputId {
    type Error = PreampError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputId> for String {
    fn from(id: OutputId) -> Self {
        id.to_string()
    }
}
