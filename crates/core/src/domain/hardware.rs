//! GPIO line abstraction, the shared hardware lock and the latching relay
//!
//! Physical lines are resolved by symbolic name through a [`GpioProvider`].
//! Every multi-step pulse sequence runs while holding one [`HardwareLock`],
//! shared by all components that drive the same relay boards.

use crate::domain::error::{PreampError, Result};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A single physical output line
pub trait GpioLine: Send {
    /// Read back the current line level
    fn get(&self) -> io::Result<bool>;

    /// Drive the line high (`true`) or low (`false`)
    fn set(&mut self, value: bool) -> io::Result<()>;
}

/// Resolves symbolic line names to physical lines
pub trait GpioProvider {
    fn line(&self, name: &str) -> Result<Box<dyn GpioLine>>;
}

/// A resolved line that remembers its name for error reporting
pub struct OutputLine {
    name: String,
    line: Box<dyn GpioLine>,
}

impl OutputLine {
    pub fn resolve(provider: &dyn GpioProvider, name: &str) -> Result<Self> {
        let line = provider.line(name)?;
        Ok(Self {
            name: name.to_string(),
            line,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> Result<bool> {
        self.line.get().map_err(|source| PreampError::HardwareIo {
            line: self.name.clone(),
            source,
        })
    }

    pub fn set(&mut self, value: bool) -> Result<()> {
        trace!(line = %self.name, value, "GPIO write");
        self.line.set(value).map_err(|source| PreampError::HardwareIo {
            line: self.name.clone(),
            source,
        })
    }
}

/// Reentrant lock serializing every hardware-mutating sequence
///
/// Cloning shares the same underlying lock.
#[derive(Clone, Default)]
pub struct HardwareLock(Arc<ReentrantMutex<()>>);

impl HardwareLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the calling thread owns the hardware
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.lock()
    }
}

/// Settle and debounce waits applied between relay actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTiming {
    pub settle: Duration,
    pub debounce: Duration,
}

impl RelayTiming {
    pub const DEFAULT_SETTLE: Duration = Duration::from_millis(15);
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3);

    /// No waits at all; for simulated hardware
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            debounce: Duration::ZERO,
        }
    }

    pub fn settle(&self) {
        wait(self.settle, "settle");
    }

    pub fn debounce(&self) {
        wait(self.debounce, "debounce");
    }
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            settle: Self::DEFAULT_SETTLE,
            debounce: Self::DEFAULT_DEBOUNCE,
        }
    }
}

fn wait(duration: Duration, what: &'static str) {
    if !duration.is_zero() {
        trace!(?duration, what, "Relay wait");
        std::thread::sleep(duration);
    }
}

/// One latching relay driven by a set/reset line pair
///
/// The two lines are never both high: each transition drops one line before
/// raising the other.
pub struct RelayLatch {
    set: OutputLine,
    reset: OutputLine,
}

impl RelayLatch {
    pub fn new(set: OutputLine, reset: OutputLine) -> Result<Self> {
        let mut relay = Self { set, reset };
        relay.reset()?;
        Ok(relay)
    }

    /// Resolve `<prefix>SET_<index>` and `<prefix>RST_<index>`
    pub fn resolve(provider: &dyn GpioProvider, prefix: &str, index: usize) -> Result<Self> {
        let set = OutputLine::resolve(provider, &format!("{}SET_{}", prefix, index))?;
        let reset = OutputLine::resolve(provider, &format!("{}RST_{}", prefix, index))?;
        Self::new(set, reset)
    }

    /// Start a set pulse (`true`) or a reset pulse (`false`)
    pub fn control(&mut self, assert: bool) -> Result<()> {
        if assert {
            self.reset.set(false)?;
            self.set.set(true)
        } else {
            self.set.set(false)?;
            self.reset.set(true)
        }
    }

    /// Drop both lines to idle
    pub fn reset(&mut self) -> Result<()> {
        self.set.set(false)?;
        self.reset.set(false)
    }
}
