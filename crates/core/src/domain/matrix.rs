//! Relay routing matrix
//!
//! One relay board split into two disjoint groups: input-select relays (at
//! most one closed) and output-select relays (any subset closed). Indices
//! passed to the select operations address positions within a group; the
//! configured board indices only name the physical relay lines.

use crate::domain::error::{PreampError, Result, Violation};
use crate::domain::hardware::{GpioProvider, HardwareLock, OutputLine, RelayLatch, RelayTiming};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, instrument, trace};

struct Board {
    power: OutputLine,
    inputs: Vec<RelayLatch>,
    outputs: Vec<RelayLatch>,
    input: Option<usize>,
    active: BTreeSet<usize>,
}

/// Clear every relay of a group, then close the selected ones
fn write_group(
    power: &mut OutputLine,
    relays: &mut [RelayLatch],
    timing: &RelayTiming,
    selected: &BTreeSet<usize>,
) -> Result<()> {
    power.set(true)?;

    for relay in relays.iter_mut() {
        relay.control(false)?;
    }
    timing.settle();

    for &index in selected {
        relays[index].control(true)?;
    }
    timing.settle();

    for relay in relays.iter_mut() {
        relay.reset()?;
    }

    power.set(false)
}

fn check_group(name: &str, indices: &[usize]) -> Result<()> {
    let unique: BTreeSet<_> = indices.iter().collect();
    if unique.len() != indices.len() {
        return Err(PreampError::Configuration(format!(
            "{} relay indices contain duplicates: {:?}",
            name, indices
        )));
    }
    Ok(())
}

fn out_of_range(parameter: &'static str, index: usize, len: usize) -> PreampError {
    PreampError::InvalidParameter {
        parameter,
        violation: Violation::OutOfRange {
            value: i64::try_from(index).unwrap_or(i64::MAX),
            min: 0,
            max: i64::try_from(len).unwrap_or(i64::MAX) - 1,
        },
    }
}

/// Input and output selection relays on a shared power rail
pub struct RoutingMatrix {
    hw: HardwareLock,
    timing: RelayTiming,
    board: Mutex<Board>,
}

impl RoutingMatrix {
    /// Resolve both relay groups and force them open
    ///
    /// `inputs` and `outputs` are board relay numbers and must not overlap.
    pub fn new(
        provider: &dyn GpioProvider,
        hw: HardwareLock,
        timing: RelayTiming,
        power_line: &str,
        prefix: &str,
        inputs: &[usize],
        outputs: &[usize],
    ) -> Result<Self> {
        check_group("input", inputs)?;
        check_group("output", outputs)?;

        let overlap: Vec<_> = inputs.iter().filter(|i| outputs.contains(i)).collect();
        if !overlap.is_empty() {
            return Err(PreampError::Configuration(format!(
                "inputs and outputs must be mutually exclusive, shared relays: {:?}",
                overlap
            )));
        }

        let resolve = |indices: &[usize]| {
            indices
                .iter()
                .map(|&index| RelayLatch::resolve(provider, prefix, index))
                .collect::<Result<Vec<_>>>()
        };

        let matrix = Self {
            hw,
            timing,
            board: Mutex::new(Board {
                power: OutputLine::resolve(provider, power_line)?,
                inputs: resolve(inputs)?,
                outputs: resolve(outputs)?,
                input: None,
                active: BTreeSet::new(),
            }),
        };
        matrix.resync()?;
        Ok(matrix)
    }

    pub fn input_count(&self) -> usize {
        self.board.lock().inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.board.lock().outputs.len()
    }

    /// Close exactly one input relay
    #[instrument(skip(self))]
    pub fn select_input(&self, index: usize) -> Result<()> {
        let _hw = self.hw.lock();
        let mut board = self.board.lock();

        if index >= board.inputs.len() {
            return Err(out_of_range("input", index, board.inputs.len()));
        }
        if board.input == Some(index) {
            trace!(index, "Input already selected");
            return Ok(());
        }

        debug!(from = ?board.input, to = index, "Switching input relays");
        let board = &mut *board;
        write_group(
            &mut board.power,
            &mut board.inputs,
            &self.timing,
            &BTreeSet::from([index]),
        )?;
        board.input = Some(index);
        Ok(())
    }

    /// Close exactly the requested output relays, opening all others
    ///
    /// Indices are compared as a set: order and repetition are ignored, and
    /// a request equal to the current set does not touch the hardware.
    #[instrument(skip(self))]
    pub fn select_outputs(&self, indices: &[usize]) -> Result<()> {
        let _hw = self.hw.lock();
        let mut board = self.board.lock();

        let len = board.outputs.len();
        if let Some(&bad) = indices.iter().find(|&&index| index >= len) {
            return Err(out_of_range("output", bad, len));
        }

        let requested: BTreeSet<usize> = indices.iter().copied().collect();
        if requested == board.active {
            trace!(outputs = ?requested, "Outputs already selected");
            return Ok(());
        }

        debug!(from = ?board.active, to = ?requested, "Switching output relays");
        let board = &mut *board;
        write_group(&mut board.power, &mut board.outputs, &self.timing, &requested)?;
        board.active = requested;
        Ok(())
    }

    /// Rewrite both groups from the cached selection regardless of history
    pub fn resync(&self) -> Result<()> {
        let _hw = self.hw.lock();
        let mut board = self.board.lock();
        let board = &mut *board;

        debug!(input = ?board.input, outputs = ?board.active, "Resynchronizing routing relays");
        let input: BTreeSet<usize> = board.input.into_iter().collect();
        write_group(&mut board.power, &mut board.inputs, &self.timing, &input)?;
        write_group(&mut board.power, &mut board.outputs, &self.timing, &board.active)
    }

    pub fn get_input(&self) -> Option<usize> {
        self.board.lock().input
    }

    pub fn get_outputs(&self) -> BTreeSet<usize> {
        self.board.lock().active.clone()
    }
}
