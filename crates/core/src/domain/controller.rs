//! Preamp controller
//!
//! Coordinates the volume ladder, the routing matrix, the amplifier power
//! switch and the filter engine behind the capability contract. Every
//! mutating call holds the shared hardware lock from start to finish.
//!
//! Mute is implemented in the routing matrix: while muted the physical
//! output set is empty and output changes only update the remembered set,
//! which is applied when mute is released.

use crate::domain::attenuator::{VolumeAttenuator, MAX_LEVEL, MIN_LEVEL};
use crate::domain::config::{output_ids, OutputConfig, PreampConfig};
use crate::domain::error::{PreampError, Result, Violation};
use crate::domain::hardware::{GpioProvider, HardwareLock};
use crate::domain::matrix::RoutingMatrix;
use crate::domain::output::OutputId;
use crate::domain::power::LazyPowerSwitch;
use crate::domain::preamp::{FilterEngine, Preamp};
use crate::domain::scheduler::Scheduler;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

struct ControllerState {
    output: Option<OutputId>,
    muted: bool,
    /// Output set that is physical whenever mute is off
    desired: BTreeSet<usize>,
    on: bool,
}

/// Snapshot of the controller for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreampStatus {
    pub on: bool,
    pub output: Option<String>,
    pub volume: u8,
    pub muted: bool,
    pub physical_outputs: Vec<usize>,
    pub amplifier_powered: bool,
}

/// Relay preamp implementing [`Preamp`]
pub struct PreampController {
    hw: HardwareLock,
    attenuator: VolumeAttenuator,
    matrix: RoutingMatrix,
    amplifier: LazyPowerSwitch,
    engine: Arc<dyn FilterEngine>,
    outputs: Vec<OutputConfig>,
    standby: OutputId,
    on_volume: u8,
    state: Mutex<ControllerState>,
}

impl PreampController {
    /// Build every component and force the relays into a known state
    ///
    /// The ladder is driven to 0, all matrix relays opened and the amplifier
    /// line dropped. The filter engine is not contacted until the first
    /// output change.
    pub fn new(
        config: &PreampConfig,
        gpio: &dyn GpioProvider,
        engine: Arc<dyn FilterEngine>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        config.validate()?;
        let standby: OutputId = config.power.standby_output.parse()?;

        let hw = HardwareLock::new();
        let timing = config.timing.relay_timing();

        let attenuator = VolumeAttenuator::new(
            gpio,
            hw.clone(),
            timing,
            &config.attenuator.power_line,
            &config.attenuator.prefix,
        )?;
        let matrix = RoutingMatrix::new(
            gpio,
            hw.clone(),
            timing,
            &config.matrix.power_line,
            &config.matrix.prefix,
            &config.matrix.inputs,
            &config.matrix.outputs,
        )?;
        let amplifier = LazyPowerSwitch::new(
            gpio,
            hw.clone(),
            scheduler,
            &config.amplifier.line,
            config.amplifier.on_delay(),
            config.amplifier.off_grace(),
        )?;

        info!(outputs = config.outputs.len(), "Preamp initialised");

        Ok(Self {
            hw,
            attenuator,
            matrix,
            amplifier,
            engine,
            outputs: config.outputs.clone(),
            standby,
            on_volume: config.power.on_volume,
            state: Mutex::new(ControllerState {
                output: None,
                muted: false,
                desired: BTreeSet::new(),
                on: false,
            }),
        })
    }

    /// Shared lock guarding every relay board of this controller
    pub fn hardware_lock(&self) -> &HardwareLock {
        &self.hw
    }

    /// Output group positions whose relays are currently closed
    pub fn physical_outputs(&self) -> BTreeSet<usize> {
        self.matrix.get_outputs()
    }

    /// Physical level of the amplifier trigger line
    pub fn amplifier_powered(&self) -> Result<bool> {
        self.amplifier.is_powered()
    }

    pub fn amplifier_off_pending(&self) -> bool {
        self.amplifier.has_pending_off()
    }

    pub fn status(&self) -> Result<PreampStatus> {
        let _hw = self.hw.lock();
        let state = self.state.lock();
        Ok(PreampStatus {
            on: state.on,
            output: state.output.as_ref().map(OutputId::to_string),
            volume: self.attenuator.get(),
            muted: state.muted,
            physical_outputs: self.matrix.get_outputs().into_iter().collect(),
            amplifier_powered: self.amplifier.is_powered()?,
        })
    }

    /// Rewrite every relay and the amplifier line from cached state
    ///
    /// Recovery path after a hardware IO failure left a sequence half done.
    #[instrument(skip(self))]
    pub fn resync(&self) -> Result<()> {
        let _hw = self.hw.lock();
        let state = self.state.lock();

        info!("Resynchronizing preamp hardware");
        self.attenuator.set(i32::from(self.attenuator.get()), true)?;
        self.matrix.resync()?;

        let amplifier = state
            .output
            .as_ref()
            .and_then(|id| self.output_config(id.output()))
            .map(|o| o.amplifier)
            .unwrap_or(false);
        self.amplifier.resync(amplifier)
    }

    /// Power off and drop the amplifier without waiting for its grace period
    ///
    /// For process exit, when a deferred power-down would never fire.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<()> {
        let _hw = self.hw.lock();
        self.power(false)?;
        self.amplifier.power_down_now()
    }

    fn output_config(&self, name: &str) -> Option<&OutputConfig> {
        self.outputs.iter().find(|o| o.name == name)
    }

    fn resolve(&self, id: &str) -> Result<(OutputId, &OutputConfig)> {
        let parsed: OutputId = id.parse()?;
        let output = self.output_config(parsed.output()).ok_or_else(|| {
            PreampError::InvalidParameter {
                parameter: "output",
                violation: Violation::Unknown(parsed.output().to_string()),
            }
        })?;
        if !output.coefficients.iter().any(|c| c == parsed.coefficients()) {
            return Err(PreampError::InvalidParameter {
                parameter: "coefficients",
                violation: Violation::Unknown(parsed.coefficients().to_string()),
            });
        }
        Ok((parsed, output))
    }

    /// Caller must hold the hardware lock
    fn apply_output(&self, state: &mut ControllerState, id: OutputId, output: &OutputConfig) -> Result<()> {
        self.engine.change_filter_coefficients(id.coefficients())?;

        if output.amplifier {
            let delay = self.amplifier.turn_on()?;
            wait_for_amplifier(delay);
        } else {
            self.amplifier.turn_off()?;
        }

        let desired: BTreeSet<usize> = output.relays.iter().copied().collect();
        if !state.muted {
            self.matrix.select_outputs(&output.relays)?;
        } else {
            debug!(outputs = ?desired, "Muted, deferring output relays");
        }
        state.desired = desired;

        info!(output = %id, muted = state.muted, "Output selected");
        state.output = Some(id);
        self.enforce_outputs(state)
    }

    /// Physical outputs must be empty while muted and the desired set otherwise
    fn enforce_outputs(&self, state: &ControllerState) -> Result<()> {
        let physical = self.matrix.get_outputs();
        let expected = if state.muted {
            BTreeSet::new()
        } else {
            state.desired.clone()
        };
        if physical != expected {
            error!(?physical, ?expected, muted = state.muted, "Output relays out of step with mute state");
            let expected: Vec<usize> = expected.into_iter().collect();
            self.matrix.select_outputs(&expected)?;
        }
        Ok(())
    }

    fn set_volume_locked(&self, level: i32) -> Result<()> {
        self.attenuator.set(level, false)?;
        debug!(level, "Volume set");
        Ok(())
    }

    fn power(&self, on: bool) -> Result<()> {
        let _hw = self.hw.lock();
        let mut state = self.state.lock();

        let output = self
            .output_config(self.standby.output())
            .ok_or_else(|| PreampError::Configuration(format!("standby output {} vanished", self.standby)))?;
        self.apply_output(&mut state, self.standby.clone(), output)?;

        let level = if on { i32::from(self.on_volume) } else { MIN_LEVEL };
        self.set_volume_locked(level)?;

        state.on = on;
        info!(on, "Preamp power state changed");
        Ok(())
    }
}

fn wait_for_amplifier(delay: Duration) {
    if !delay.is_zero() {
        debug!(?delay, "Waiting for amplifier");
        std::thread::sleep(delay);
    }
}

impl Preamp for PreampController {
    fn get_outputs(&self) -> Vec<String> {
        output_ids(&self.outputs)
            .iter()
            .map(OutputId::to_string)
            .collect()
    }

    #[instrument(skip(self))]
    fn set_output(&self, id: &str) -> Result<()> {
        let (id, output) = self.resolve(id)?;
        let _hw = self.hw.lock();
        let mut state = self.state.lock();
        self.apply_output(&mut state, id, output)
    }

    fn get_output(&self) -> Option<String> {
        self.state.lock().output.as_ref().map(OutputId::to_string)
    }

    fn get_volume(&self) -> u8 {
        self.attenuator.get()
    }

    #[instrument(skip(self))]
    fn set_volume(&self, level: i32) -> Result<()> {
        let _hw = self.hw.lock();
        self.set_volume_locked(level)
    }

    #[instrument(skip(self))]
    fn adjust_volume(&self, delta: i32) -> Result<u8> {
        let _hw = self.hw.lock();
        let current = i32::from(self.attenuator.get());
        let level = current.saturating_add(delta).clamp(MIN_LEVEL, MAX_LEVEL);
        self.set_volume_locked(level)?;
        Ok(self.attenuator.get())
    }

    #[instrument(skip(self))]
    fn mute(&self, muted: bool) -> Result<()> {
        let _hw = self.hw.lock();
        let mut state = self.state.lock();

        if muted {
            if !state.muted {
                state.desired = self.matrix.get_outputs();
            }
            self.matrix.select_outputs(&[])?;
        } else {
            let desired: Vec<usize> = state.desired.iter().copied().collect();
            self.matrix.select_outputs(&desired)?;
        }

        state.muted = muted;
        info!(muted, "Mute changed");
        self.enforce_outputs(&state)
    }

    fn muted(&self) -> bool {
        self.state.lock().muted
    }

    fn toggle_mute(&self) -> Result<bool> {
        let _hw = self.hw.lock();
        let muted = !self.muted();
        self.mute(muted)?;
        Ok(muted)
    }

    #[instrument(skip(self))]
    fn turn_on(&self) -> Result<()> {
        self.power(true)
    }

    #[instrument(skip(self))]
    fn turn_off(&self) -> Result<()> {
        self.power(false)
    }

    fn is_on(&self) -> bool {
        self.state.lock().on
    }
}
