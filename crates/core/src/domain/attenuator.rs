//! Binary-weighted relay ladder volume attenuator
//!
//! Each bit of the 8-bit attenuation level drives one latching relay. Writes
//! are restricted to the relays whose bit actually changes, which avoids
//! needless relay wear and audible clicks.

use crate::domain::error::{PreampError, Result};
use crate::domain::hardware::{GpioProvider, HardwareLock, OutputLine, RelayLatch, RelayTiming};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace};

/// Number of relays in the ladder
pub const LADDER_BITS: usize = 8;

/// Lowest accepted level (maximum attenuation)
pub const MIN_LEVEL: i32 = 0;

/// Highest accepted level
pub const MAX_LEVEL: i32 = 255;

struct Ladder {
    power: OutputLine,
    relays: Vec<RelayLatch>,
    level: u8,
}

impl Ladder {
    fn write(&mut self, timing: &RelayTiming, level: u8, mask: u8) -> Result<()> {
        let clear = mask & !level;
        let assert = mask & level;

        self.power.set(true)?;
        timing.settle();

        for bit in bits(clear) {
            self.relays[bit].control(false)?;
        }
        timing.debounce();

        for bit in bits(assert) {
            self.relays[bit].control(true)?;
        }
        timing.settle();

        for bit in bits(mask) {
            self.relays[bit].reset()?;
        }
        timing.settle();

        self.power.set(false)
    }
}

fn bits(mask: u8) -> impl Iterator<Item = usize> {
    (0..LADDER_BITS).filter(move |bit| mask & (1 << bit) != 0)
}

/// Relay ladder producing an attenuation level in `0..=255`
pub struct VolumeAttenuator {
    hw: HardwareLock,
    timing: RelayTiming,
    ladder: Mutex<Ladder>,
}

impl VolumeAttenuator {
    /// Resolve the ladder lines and force every relay to level 0
    ///
    /// The physical state of the relays is unknown at startup, so the first
    /// write pulses the whole ladder.
    pub fn new(
        provider: &dyn GpioProvider,
        hw: HardwareLock,
        timing: RelayTiming,
        power_line: &str,
        prefix: &str,
    ) -> Result<Self> {
        let power = OutputLine::resolve(provider, power_line)?;
        let relays = (0..LADDER_BITS)
            .map(|bit| RelayLatch::resolve(provider, prefix, bit))
            .collect::<Result<Vec<_>>>()?;

        let attenuator = Self {
            hw,
            timing,
            ladder: Mutex::new(Ladder {
                power,
                relays,
                level: 0,
            }),
        };
        attenuator.set(MIN_LEVEL, true)?;
        Ok(attenuator)
    }

    /// Cached level; never touches hardware
    pub fn get(&self) -> u8 {
        let _hw = self.hw.lock();
        self.ladder.lock().level
    }

    /// Drive the ladder to `level`
    ///
    /// With `force` every relay is rewritten regardless of the cached level.
    /// The cache is only updated once the full sequence has completed.
    #[instrument(skip(self))]
    pub fn set(&self, level: i32, force: bool) -> Result<()> {
        let level = u8::try_from(level).map_err(|_| {
            PreampError::out_of_range("volume", i64::from(level), MIN_LEVEL.into(), MAX_LEVEL.into())
        })?;

        let _hw = self.hw.lock();
        let mut ladder = self.ladder.lock();

        let mask = if force { u8::MAX } else { level ^ ladder.level };
        if mask == 0 {
            trace!(level, "Volume unchanged");
            return Ok(());
        }

        debug!(from = ladder.level, to = level, mask, "Writing relay ladder");
        ladder.write(&self.timing, level, mask)?;
        ladder.level = level;
        Ok(())
    }
}
