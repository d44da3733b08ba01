//! Thread-backed scheduler
//!
//! A single worker thread owns a deadline-ordered queue. New tasks arrive
//! over a crossbeam channel; the worker sleeps on the channel until either a
//! task arrives or the earliest deadline passes.

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use phire_core::domain::scheduler::{Scheduler, Task, TaskHandle};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicU64};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

struct Job {
    due: Instant,
    seq: u64,
    handle: TaskHandle,
    task: Task,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Runs deferred tasks on a dedicated timer thread
pub struct ThreadScheduler {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    seq: AtomicU64,
}

impl ThreadScheduler {
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();

        let worker = thread::Builder::new()
            .name("phire-timer".to_string())
            .spawn(move || {
                let mut queue: BinaryHeap<Reverse<Job>> = BinaryHeap::new();

                loop {
                    let received = match queue.peek() {
                        Some(Reverse(next)) => rx.recv_deadline(next.due),
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match received {
                        Ok(job) => queue.push(Reverse(job)),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let now = Instant::now();
                    while queue.peek().is_some_and(|Reverse(job)| job.due <= now) {
                        if let Some(Reverse(job)) = queue.pop() {
                            run(job);
                        }
                    }
                }

                debug!(dropped = queue.len(), "Timer thread stopped");
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            seq: AtomicU64::new(0),
        })
    }
}

fn run(job: Job) {
    if !job.handle.claim() {
        trace!(seq = job.seq, "Skipping cancelled task");
        return;
    }
    if panic::catch_unwind(AssertUnwindSafe(job.task)).is_err() {
        error!(seq = job.seq, "Scheduled task panicked");
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let seq = self.seq.fetch_add(1, atomic::Ordering::Relaxed);
        let job = Job {
            due: Instant::now() + delay,
            seq,
            handle: handle.clone(),
            task,
        };

        let sent = self.tx.as_ref().map(|tx| tx.send(job).is_ok()).unwrap_or(false);
        if !sent {
            error!(seq, "Timer thread is gone, task will not run");
            handle.cancel();
        }
        handle
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Timer thread panicked");
            }
        }
    }
}
