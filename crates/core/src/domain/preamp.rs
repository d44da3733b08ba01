//! Capability contract exposed to transport, automation and CLI callers,
//! and the filter engine collaborator consumed by the controller

use crate::domain::error::Result;

/// Everything an upstream caller can ask of a preamp
///
/// There are no default implementations; a backend that cannot support an
/// operation must say so through its return value.
pub trait Preamp: Send + Sync {
    /// Every configured composite output identifier, as `"output:coeff"`
    fn get_outputs(&self) -> Vec<String>;

    /// Switch routing and filter coefficients to the given composite output
    fn set_output(&self, id: &str) -> Result<()>;

    /// Current composite output; `None` until an output has been applied
    /// since startup
    fn get_output(&self) -> Option<String>;

    fn get_volume(&self) -> u8;

    fn set_volume(&self, level: i32) -> Result<()>;

    /// Add `delta` to the volume, clamped to the valid range; returns the
    /// level that was applied
    fn adjust_volume(&self, delta: i32) -> Result<u8>;

    fn mute(&self, muted: bool) -> Result<()>;

    fn muted(&self) -> bool;

    /// Flip the mute state atomically; returns the new state
    fn toggle_mute(&self) -> Result<bool>;

    fn turn_on(&self) -> Result<()>;

    fn turn_off(&self) -> Result<()>;

    /// Logical power state, not the amplifier line
    fn is_on(&self) -> bool;
}

/// External FIR filter engine
pub trait FilterEngine: Send + Sync {
    /// Load the named coefficient set; failures are reported, never retried
    fn change_filter_coefficients(&self, name: &str) -> Result<()>;
}
