//! Error taxonomy for the preamp core
//!
//! Every error surfaces synchronously to the immediate caller. Nothing in this
//! crate retries.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PreampError>;

/// Errors raised by the preamp components
#[derive(Debug, Error)]
pub enum PreampError {
    /// Invalid relay or output configuration detected at construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller supplied a value the hardware cannot accept; nothing was written
    #[error("Invalid {parameter}: {violation}")]
    InvalidParameter {
        parameter: &'static str,
        violation: Violation,
    },

    /// A GPIO line read or write failed part way through a sequence
    #[error("GPIO line {line}: {source}")]
    HardwareIo {
        line: String,
        #[source]
        source: std::io::Error,
    },

    /// The filter engine rejected the request or could not be reached
    #[error("Filter engine error: {0}")]
    ExternalEngine(String),
}

/// Why a parameter was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    OutOfRange { value: i64, min: i64, max: i64 },
    Malformed(String),
    Unknown(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::OutOfRange { value, min, max } => {
                write!(f, "{} is outside [{}, {}]", value, min, max)
            }
            Violation::Malformed(raw) => write!(f, "malformed value '{}'", raw),
            Violation::Unknown(name) => write!(f, "'{}' is not configured", name),
        }
    }
}

impl PreampError {
    pub(crate) fn out_of_range(parameter: &'static str, value: i64, min: i64, max: i64) -> Self {
        Self::InvalidParameter {
            parameter,
            violation: Violation::OutOfRange { value, min, max },
        }
    }

    /// True when the hardware may be left partially applied and cached state
    /// should not be trusted until a forced resync
    pub fn requires_resync(&self) -> bool {
        matches!(self, PreampError::HardwareIo { .. })
    }
}
