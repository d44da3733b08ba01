//! Linux sysfs GPIO (`/sys/class/gpio`)

use phire_core::domain::config::GpioConfig;
use phire_core::domain::error::{PreampError, Result};
use phire_core::domain::hardware::{GpioLine, GpioProvider};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolves symbolic names to exported sysfs GPIO lines
pub struct SysfsGpio {
    base: PathBuf,
    lines: BTreeMap<String, u32>,
}

impl SysfsGpio {
    pub fn new(base: impl Into<PathBuf>, lines: BTreeMap<String, u32>) -> Self {
        Self {
            base: base.into(),
            lines,
        }
    }

    pub fn from_config(config: &GpioConfig) -> Self {
        Self::new(config.base_path.clone(), config.lines.clone())
    }

    fn io_error(name: &str, source: io::Error) -> PreampError {
        PreampError::HardwareIo {
            line: name.to_string(),
            source,
        }
    }

    fn export(&self, name: &str, number: u32, dir: &Path) -> Result<()> {
        if dir.exists() {
            return Ok(());
        }
        info!(line = name, number, "Exporting GPIO");
        fs::write(self.base.join("export"), number.to_string())
            .map_err(|e| Self::io_error(name, e))
    }
}

impl GpioProvider for SysfsGpio {
    fn line(&self, name: &str) -> Result<Box<dyn GpioLine>> {
        let number = *self.lines.get(name).ok_or_else(|| {
            PreampError::Configuration(format!("GPIO line '{}' has no number in [gpio.lines]", name))
        })?;

        let dir = self.base.join(format!("gpio{}", number));
        self.export(name, number, &dir)?;

        // "low" configures an output that starts deasserted, without a glitch
        fs::write(dir.join("direction"), "low").map_err(|e| Self::io_error(name, e))?;
        debug!(line = name, number, "GPIO configured as output");

        Ok(Box::new(SysfsLine {
            value: dir.join("value"),
        }))
    }
}

struct SysfsLine {
    value: PathBuf,
}

impl GpioLine for SysfsLine {
    fn get(&self) -> io::Result<bool> {
        let raw = fs::read_to_string(&self.value)?;
        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected GPIO value '{}'", other),
            )),
        }
    }

    fn set(&mut self, value: bool) -> io::Result<()> {
        fs::write(&self.value, if value { "1" } else { "0" })
    }
}
