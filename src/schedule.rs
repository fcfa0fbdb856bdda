//! When a queued task actually starts.
//!
//! The task queue never runs a handler synchronously from `enqueue`. It hands
//! a start job to a [`Scheduler`], which decides when to run it and may return
//! a cancel callback. Superseding, aborting, resetting and destroying all
//! collapse through that cancel callback, so a debounced task that is replaced
//! before its timer fires never starts at all.

use std::time::Duration;

use tokio::runtime::Handle;

/// Work handed to a scheduler.
pub type Job = Box<dyn FnOnce() + Send>;

/// Callback that withdraws a scheduled job before it runs.
pub type CancelSchedule = Box<dyn FnOnce() + Send>;

/// Decides when a queued task starts.
pub trait Scheduler: Send + Sync {
    /// Arrange for `job` to run later. Return a cancel callback if the job can
    /// be withdrawn.
    fn schedule(&self, job: Job) -> Option<CancelSchedule>;
}

impl<F> Scheduler for F
where
    F: Fn(Job) -> Option<CancelSchedule> + Send + Sync,
{
    fn schedule(&self, job: Job) -> Option<CancelSchedule> {
        self(job)
    }
}

/// Default scheduler: run on the next turn of the current tokio runtime.
///
/// Everything enqueued in the same synchronous turn is recorded before any of
/// it starts, which is what lets a second same-key request replace the first
/// before the first ever runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct Microtask;

impl Scheduler for Microtask {
    fn schedule(&self, job: Job) -> Option<CancelSchedule> {
        match Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(async move { job() });
                Some(Box::new(move || task.abort()))
            }
            Err(_) => {
                tracing::warn!("no tokio runtime; running scheduled job inline");
                job();
                None
            }
        }
    }
}

/// Start the task after a quiet period.
///
/// Combined with same-key supersession this gives classic debouncing: each
/// new request replaces the queued one and restarts the timer.
#[derive(Clone, Copy, Debug)]
pub struct Debounce(pub Duration);

impl Scheduler for Debounce {
    fn schedule(&self, job: Job) -> Option<CancelSchedule> {
        let delay = self.0;
        match Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    job();
                });
                Some(Box::new(move || task.abort()))
            }
            Err(_) => {
                tracing::warn!(?delay, "no tokio runtime; debounced job runs inline");
                job();
                None
            }
        }
    }
}
