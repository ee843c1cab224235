//! Defines the events broadcast by a `ListTimer`.
//!
//! These mirror the timer's observer callbacks as plain, cloneable values so
//! that asynchronous consumers can follow the timer through a
//! `tokio::sync::broadcast` receiver instead of implementing an observer.

use crate::common::PlanKey;
use chrono::{DateTime, Utc};

/// Events related to the registry and the plans driven by a `ListTimer`.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    /// Fired when a plan is registered and its driver has been started.
    PlanScheduled { key: PlanKey, name: String },
    /// Fired when a plan leaves the registry, whether removed by a caller or
    /// because its policy has no further runs.
    PlanRemoved { key: PlanKey, name: String },
    /// Fired each time a scheduled plan starts a run.
    PlanRan {
        key: PlanKey,
        name: String,
        run: u64,
        expected: Option<DateTime<Utc>>,
        actual: DateTime<Utc>,
    },
    /// Fired each time a scheduled plan completes a run.
    PlanFinished {
        key: PlanKey,
        name: String,
        finished_count: u64,
        /// The rendered failure, if the run failed.
        failure: Option<String>,
    },
    /// Fired once per `clear()`.
    Cleared { removed: usize },
    /// Fired once when the timer stops accepting plans.
    Shutdown,
    /// Fired once when the timer is shut down and its last driver has exited.
    Terminated,
}

impl TimerEvent {
    /// The key of the plan this event concerns, if any.
    pub fn plan_key(&self) -> Option<PlanKey> {
        match self {
            TimerEvent::PlanScheduled { key, .. }
            | TimerEvent::PlanRemoved { key, .. }
            | TimerEvent::PlanRan { key, .. }
            | TimerEvent::PlanFinished { key, .. } => Some(*key),
            TimerEvent::Cleared { .. } | TimerEvent::Shutdown | TimerEvent::Terminated => None,
        }
    }
}
