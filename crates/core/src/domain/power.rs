//! Lazy power sequencing for the downstream amplifier
//!
//! Power-up reports how long the caller must wait before the amplifier output
//! is valid. Power-down is deferred by a grace period so that rapid output
//! changes do not cycle the amplifier relay; any power-up inside the grace
//! period cancels the pending power-down.

use crate::domain::error::Result;
use crate::domain::hardware::{GpioProvider, HardwareLock, OutputLine};
use crate::domain::scheduler::{Scheduler, TaskHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

struct PendingOff {
    id: u64,
    handle: TaskHandle,
}

struct SwitchState {
    line: OutputLine,
    pending: Option<PendingOff>,
    next_id: u64,
}

/// One power line with delayed-on and grace-period-delayed-off semantics
pub struct LazyPowerSwitch {
    hw: HardwareLock,
    scheduler: Arc<dyn Scheduler>,
    state: Arc<Mutex<SwitchState>>,
    on_delay: Duration,
    off_grace: Duration,
}

impl LazyPowerSwitch {
    /// Resolve the power line and drive it low
    pub fn new(
        provider: &dyn GpioProvider,
        hw: HardwareLock,
        scheduler: Arc<dyn Scheduler>,
        line: &str,
        on_delay: Duration,
        off_grace: Duration,
    ) -> Result<Self> {
        let mut line = OutputLine::resolve(provider, line)?;
        {
            let _hw = hw.lock();
            line.set(false)?;
        }

        Ok(Self {
            hw,
            scheduler,
            state: Arc::new(Mutex::new(SwitchState {
                line,
                pending: None,
                next_id: 0,
            })),
            on_delay,
            off_grace,
        })
    }

    pub fn on_delay(&self) -> Duration {
        self.on_delay
    }

    pub fn off_grace(&self) -> Duration {
        self.off_grace
    }

    /// Cancel any pending power-down and raise the line
    ///
    /// Returns the configured on-delay when the line was off, zero when it
    /// was already on. Waiting out the delay is the caller's job.
    pub fn turn_on(&self) -> Result<Duration> {
        let _hw = self.hw.lock();
        let mut state = self.state.lock();

        if let Some(pending) = state.pending.take() {
            pending.handle.cancel();
            debug!(task = pending.id, "Cancelled deferred power-off");
        }

        if state.line.get()? {
            return Ok(Duration::ZERO);
        }

        state.line.set(true)?;
        info!(line = state.line.name(), delay = ?self.on_delay, "Amplifier power on");
        Ok(self.on_delay)
    }

    /// Schedule the line to drop after the grace period
    ///
    /// Does nothing when the line is already off or a power-down is already
    /// pending.
    pub fn turn_off(&self) -> Result<()> {
        let _hw = self.hw.lock();
        let mut state = self.state.lock();

        if state.pending.is_some() || !state.line.get()? {
            return Ok(());
        }

        let id = state.next_id;
        state.next_id += 1;

        let hw = self.hw.clone();
        let shared = Arc::clone(&self.state);
        let handle = self.scheduler.schedule(
            self.off_grace,
            Box::new(move || deferred_off(&hw, &shared, id)),
        );

        debug!(task = id, grace = ?self.off_grace, "Scheduled deferred power-off");
        state.pending = Some(PendingOff { id, handle });
        Ok(())
    }

    /// Cancel any pending power-down and drop the line now
    pub fn power_down_now(&self) -> Result<()> {
        let _hw = self.hw.lock();
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.take() {
            pending.handle.cancel();
        }
        state.line.set(false)?;
        info!(line = state.line.name(), "Amplifier power off");
        Ok(())
    }

    /// Physical state of the power line
    pub fn is_powered(&self) -> Result<bool> {
        let _hw = self.hw.lock();
        self.state.lock().line.get()
    }

    pub fn has_pending_off(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Drive the line to match its logical state again
    ///
    /// Requiring power cancels a pending power-down. Otherwise a pending
    /// power-down keeps the line high until it fires.
    pub fn resync(&self, powered: bool) -> Result<()> {
        let _hw = self.hw.lock();
        let mut state = self.state.lock();
        if powered {
            if let Some(pending) = state.pending.take() {
                pending.handle.cancel();
            }
        }
        let level = powered || state.pending.is_some();
        state.line.set(level)
    }
}

/// Runs on the scheduler's timing facility
///
/// Takes the hardware lock first, then acts only if this task is still the
/// pending one. A `turn_on()` that won the lock in the meantime has already
/// cleared the marker, which makes a late firing harmless.
fn deferred_off(hw: &HardwareLock, shared: &Mutex<SwitchState>, id: u64) {
    let _hw = hw.lock();
    let mut state = shared.lock();

    match state.pending.as_ref() {
        Some(pending) if pending.id == id => {}
        _ => {
            debug!(task = id, "Deferred power-off superseded");
            return;
        }
    }

    state.pending = None;
    match state.line.set(false) {
        Ok(()) => info!(line = state.line.name(), "Amplifier power off"),
        Err(e) => error!(error = %e, "Deferred power-off failed"),
    }
}
