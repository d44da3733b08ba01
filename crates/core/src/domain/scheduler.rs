//! Deferred task scheduling contract
//!
//! A [`Scheduler`] runs a callback after a delay on a timing facility outside
//! the caller's stack. The returned [`TaskHandle`] decides atomically whether
//! the task fires or is cancelled, so `cancel()` may be called any number of
//! times, before or after the task has run.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Work executed by a scheduler once its delay elapses
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Timing facility for deferred work
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared handle to one scheduled task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Cancel the task if it has not started yet
    ///
    /// Returns `true` only for the call that actually prevented the task from
    /// running. Cancelling a fired or already cancelled task does nothing.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the task for execution; schedulers run the task only on `true`
    pub fn claim(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}
