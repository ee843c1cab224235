//! Error types for the cadence engine.
//!
//! Usage errors are returned synchronously to the caller that misused an
//! instance. Failures of a work body are never returned from `run()`; they are
//! captured as a [`Failure`] and kept on the task or plan that produced them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Usage errors raised by [`Task`](crate::components::task::Task) and
/// [`BlockedTask`](crate::components::task::BlockedTask).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// `run()` was called on a task that has already started or finished.
    #[error("task `{0}` has already been started")]
    AlreadyStarted(String),
}

/// Usage errors raised by [`Plan`](crate::components::plan::Plan).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// `run()` was called while a previous run of the same plan is in flight.
    #[error("plan `{0}` is already running")]
    AlreadyRunning(String),

    /// A periodic policy was built with a zero period.
    #[error("plan `{0}` needs a period greater than zero")]
    InvalidPeriod(String),
}

/// Usage errors raised by [`ListTimer`](crate::engine::ListTimer).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// The timer no longer accepts new plans.
    #[error("timer has been shut down; cannot schedule plan `{0}`")]
    Shutdown(String),

    /// The driver thread for a plan could not be started.
    #[error("failed to start driver for plan `{plan}`: {reason}")]
    Spawn { plan: String, reason: String },
}

/// A failure captured from a task or plan body.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    /// The body returned an error.
    #[error("{0:#}")]
    Returned(anyhow::Error),

    /// The body panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl Failure {
    /// Returns `true` if this failure came from a panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, Failure::Panicked(_))
    }
}

/// Runs a work body, turning both an `Err` return and a panic into a [`Failure`].
pub(crate) fn capture<F>(body: F) -> Option<Failure>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(Failure::Returned(err)),
        Err(payload) => Some(Failure::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
