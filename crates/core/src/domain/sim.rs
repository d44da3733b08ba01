//! Simulated collaborators
//!
//! In-memory GPIO lines with a write journal, a scheduler driven by a virtual
//! clock and a filter engine that records what it was asked to apply. Used by
//! the unit tests and by the `simulated` backend of the CLI.

use crate::domain::error::{PreampError, Result};
use crate::domain::hardware::{GpioLine, GpioProvider};
use crate::domain::preamp::FilterEngine;
use crate::domain::scheduler::{Scheduler, Task, TaskHandle};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct GpioState {
    levels: HashMap<String, bool>,
    journal: Vec<(String, bool)>,
    latches: HashMap<String, bool>,
    failing: HashSet<String>,
}

impl GpioState {
    fn record(&mut self, name: &str, value: bool) {
        self.levels.insert(name.to_string(), value);
        self.journal.push((name.to_string(), value));

        if !value {
            return;
        }
        if let Some((prefix, index)) = name.rsplit_once("SET_") {
            self.latches.insert(format!("{}{}", prefix, index), true);
        } else if let Some((prefix, index)) = name.rsplit_once("RST_") {
            self.latches.insert(format!("{}{}", prefix, index), false);
        }
    }
}

/// GPIO provider backed by memory
///
/// Lines with the same name share their level. Any `true` write to a
/// `<prefix>SET_<n>` or `<prefix>RST_<n>` line moves the modelled latching
/// relay `<prefix><n>`.
#[derive(Clone, Default)]
pub struct SimulatedGpio {
    state: Arc<Mutex<GpioState>>,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write since the last [`clear_journal`](Self::clear_journal)
    pub fn journal(&self) -> Vec<(String, bool)> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    /// Lines that received a `true` write since the journal was cleared
    pub fn pulsed_lines(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|(_, value)| *value)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn level(&self, name: &str) -> bool {
        self.state.lock().levels.get(name).copied().unwrap_or(false)
    }

    /// Position of the relay `<prefix><index>`, `None` if it was never pulsed
    pub fn latched(&self, prefix: &str, index: usize) -> Option<bool> {
        self.state
            .lock()
            .latches
            .get(&format!("{}{}", prefix, index))
            .copied()
    }

    /// Make every subsequent access to `name` fail
    pub fn fail_line(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    pub fn heal_line(&self, name: &str) {
        self.state.lock().failing.remove(name);
    }
}

impl GpioProvider for SimulatedGpio {
    fn line(&self, name: &str) -> Result<Box<dyn GpioLine>> {
        self.state.lock().levels.entry(name.to_string()).or_insert(false);
        Ok(Box::new(SimulatedLine {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct SimulatedLine {
    name: String,
    state: Arc<Mutex<GpioState>>,
}

impl SimulatedLine {
    fn check(&self, state: &GpioState) -> io::Result<()> {
        if state.failing.contains(&self.name) {
            Err(io::Error::other(format!("simulated failure on {}", self.name)))
        } else {
            Ok(())
        }
    }
}

impl GpioLine for SimulatedLine {
    fn get(&self) -> io::Result<bool> {
        let state = self.state.lock();
        self.check(&state)?;
        Ok(state.levels.get(&self.name).copied().unwrap_or(false))
    }

    fn set(&mut self, value: bool) -> io::Result<()> {
        let mut state = self.state.lock();
        self.check(&state)?;
        state.record(&self.name, value);
        Ok(())
    }
}

struct ManualEntry {
    due: Duration,
    handle: TaskHandle,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    queue: Vec<ManualEntry>,
    scheduled: usize,
}

/// Scheduler whose clock only moves when [`advance`](Self::advance) is called
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the virtual clock forward and run every task that became due
    ///
    /// Tasks run on the calling thread, outside the scheduler's own lock.
    pub fn advance(&self, by: Duration) {
        let mut due = {
            let mut state = self.state.lock();
            state.now += by;
            let now = state.now;
            let (due, waiting): (Vec<_>, Vec<_>) =
                state.queue.drain(..).partition(|entry| entry.due <= now);
            state.queue = waiting;
            due
        };

        due.sort_by_key(|entry| entry.due);
        for entry in due {
            if entry.handle.claim() {
                (entry.task)();
            }
        }
    }

    /// Tasks still waiting and not cancelled
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|entry| entry.handle.is_pending())
            .count()
    }

    /// Total number of tasks ever scheduled
    pub fn scheduled(&self) -> usize {
        self.state.lock().scheduled
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let mut state = self.state.lock();
        let due = state.now + delay;
        state.scheduled += 1;
        state.queue.push(ManualEntry {
            due,
            handle: handle.clone(),
            task,
        });
        handle
    }
}

/// Filter engine that records applied coefficient sets
#[derive(Default)]
pub struct RecordingFilterEngine {
    applied: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingFilterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn current(&self) -> Option<String> {
        self.applied.lock().last().cloned()
    }

    /// Reject every request until called again with `false`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl FilterEngine for RecordingFilterEngine {
    fn change_filter_coefficients(&self, name: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PreampError::ExternalEngine(format!(
                "engine unreachable while applying '{}'",
                name
            )));
        }
        self.applied.lock().push(name.to_string());
        Ok(())
    }
}
