//! Concrete collaborators for the preamp core
//!
//! - Linux sysfs GPIO lines
//! - BruteFIR filter engine client
//! - Thread-backed deferred task scheduler

pub mod brutefir;
pub mod gpio;
pub mod scheduler;

pub use brutefir::{BruteFir, BruteFirError};
pub use gpio::SysfsGpio;
pub use scheduler::ThreadScheduler;
