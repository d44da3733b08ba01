//! GPIO line providers backed by the operating system
//!
//! The kernel numbers lines; the configuration maps the symbolic names used
//! by the relay boards onto those numbers.

pub mod sysfs;

pub use sysfs::SysfsGpio;
