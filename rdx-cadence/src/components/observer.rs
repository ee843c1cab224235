//! Observer contracts for tasks, plans and timers.
//!
//! Every callback has an empty default body, so an observer only implements
//! the events it cares about. Callbacks run synchronously on the thread that
//! performed the transition and must not block.

use crate::common::PlanKey;
use crate::components::plan::Plan;
use crate::components::task::Task;
use crate::error::{panic_message, Failure};
use chrono::{DateTime, Utc};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Receives lifecycle events of a [`Task`].
#[allow(unused_variables)]
pub trait TaskObserver: Send + Sync {
    /// The task moved to `Started` and is about to execute its body.
    fn on_started(&self, task: &Task) {}

    /// The task moved to `Finished`. `failure` is set if the body failed.
    fn on_finished(&self, task: &Task, failure: Option<&Failure>) {}
}

/// Receives run events of a [`Plan`].
#[allow(unused_variables)]
pub trait PlanObserver: Send + Sync {
    /// A run is starting. `run` is the 1-based number of this invocation.
    fn on_run(
        &self,
        plan: &Plan,
        run: u64,
        expected: Option<DateTime<Utc>>,
        actual: DateTime<Utc>,
    ) {
    }

    /// A run completed and the plan is idle again.
    fn on_finished(&self, plan: &Plan, finished_count: u64, failure: Option<&Failure>) {}
}

/// Receives registry events of a [`ListTimer`](crate::engine::ListTimer).
#[allow(unused_variables)]
pub trait TimerObserver: Send + Sync {
    fn on_scheduled(&self, key: PlanKey, plan: &Arc<Plan>) {}

    fn on_removed(&self, key: PlanKey, plan: &Arc<Plan>) {}

    /// Fired once per `clear()`, after every plan has been removed.
    fn on_cleared(&self) {}

    fn on_shutdown(&self) {}

    /// Fired once, when the timer is shut down and its last driver exits.
    fn on_terminated(&self) {}
}

/// A set of strongly held observers.
///
/// Observers are compared by identity, so adding the same `Arc` twice is a
/// no-op. The set lives inside the owning instance's locked state.
pub struct ObserverSet<O: ?Sized> {
    entries: Vec<Arc<O>>,
}

impl<O: ?Sized> ObserverSet<O> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds an observer. Returns `false` if it was already registered.
    pub fn add(&mut self, observer: Arc<O>) -> bool {
        if self.contains(&observer) {
            return false;
        }
        self.entries.push(observer);
        true
    }

    /// Removes an observer. Returns `false` if it was not registered.
    pub fn remove(&mut self, observer: &Arc<O>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| !same(entry, observer));
        self.entries.len() != before
    }

    pub fn contains(&self, observer: &Arc<O>) -> bool {
        self.entries.iter().any(|entry| same(entry, observer))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clones the current membership so it can be notified without the lock.
    pub fn snapshot(&self) -> Vec<Arc<O>> {
        self.entries.clone()
    }
}

impl<O: ?Sized> Default for ObserverSet<O> {
    fn default() -> Self {
        Self::new()
    }
}

fn same<O: ?Sized>(a: &Arc<O>, b: &Arc<O>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// Delivers an event to every observer in `observers`.
///
/// A panicking observer is logged and skipped; the rest still receive the event.
pub(crate) fn notify<O: ?Sized>(
    observers: &[Arc<O>],
    event: &'static str,
    mut deliver: impl FnMut(&O),
) {
    for observer in observers {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| deliver(observer))) {
            error!(
                event = event,
                "observer panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}
