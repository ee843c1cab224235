//! Recurring plans and the policies that decide when they run next.

use crate::common::PlanBody;
use crate::components::observer::{notify, ObserverSet, PlanObserver};
use crate::error::{capture, Failure, PlanError};
use crate::time::{self, TimeMeasurer};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Decides when a plan should run again after a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Run every `period`, measured from the actual start of the previous run.
    /// Slow runs push the whole cadence back; drift is not corrected.
    FixedPeriod(Duration),
    /// Run a single time.
    Once,
    /// Like `FixedPeriod`, but stop once the next run would land after `deadline`.
    Until {
        period: Duration,
        deadline: DateTime<Utc>,
    },
}

impl SchedulePolicy {
    /// Computes the next due time from the actual start of the last run.
    ///
    /// `None` means the plan has no further runs.
    pub fn next_run_time(&self, actual_run_time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match *self {
            SchedulePolicy::FixedPeriod(period) => Some(anchor(actual_run_time, period)),
            SchedulePolicy::Once => None,
            SchedulePolicy::Until { period, deadline } => {
                let next = anchor(actual_run_time, period);
                (next <= deadline).then_some(next)
            }
        }
    }

    pub fn period(&self) -> Option<Duration> {
        match *self {
            SchedulePolicy::FixedPeriod(period) | SchedulePolicy::Until { period, .. } => {
                Some(period)
            }
            SchedulePolicy::Once => None,
        }
    }
}

fn anchor(actual_run_time: Option<DateTime<Utc>>, period: Duration) -> DateTime<Utc> {
    match actual_run_time {
        Some(actual) => time::add(actual, period),
        None => time::add(time::now(), period),
    }
}

/// The run state of a [`Plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanState {
    Idle,
    Running,
}

/// A point-in-time copy of a plan's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStats {
    pub name: String,
    pub state: PlanState,
    pub finished_count: u64,
    pub last_failure_count: u64,
    pub expected_run_time: Option<DateTime<Utc>>,
    pub actual_run_time: Option<DateTime<Utc>>,
    pub last_run_duration: Option<Duration>,
    pub exhausted: bool,
}

struct PlanInner {
    state: PlanState,
    /// Runs entered so far.
    started_runs: u64,
    /// Runs whose finished event has been delivered; waiters park on this.
    settled_runs: u64,
    finished_count: u64,
    last_failure: Option<Arc<Failure>>,
    last_failure_count: u64,
    expected_run_time: Option<DateTime<Utc>>,
    actual_run_time: Option<DateTime<Utc>>,
    last_run_duration: Option<Duration>,
    exhausted: bool,
    observers: ObserverSet<dyn PlanObserver>,
}

/// A recurring unit of work.
///
/// Each call to [`Plan::run`] executes the body once on the calling thread.
/// A plan never runs concurrently with itself. Failures of the body are
/// captured and counted; they never escape `run`, so a driver thread can keep
/// invoking a plan that fails every time.
pub struct Plan {
    name: String,
    policy: SchedulePolicy,
    next_run_offset: Duration,
    body: Mutex<PlanBody>,
    inner: Mutex<PlanInner>,
    idle: Condvar,
}

impl Plan {
    /// Creates an idle plan driven by `policy`.
    pub fn new(
        name: impl Into<String>,
        policy: SchedulePolicy,
        body: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<Self, PlanError> {
        let name = name.into();
        if policy.period() == Some(Duration::ZERO) {
            return Err(PlanError::InvalidPeriod(name));
        }
        Ok(Self::build(name, policy, Box::new(body)))
    }

    fn build(name: String, policy: SchedulePolicy, body: PlanBody) -> Self {
        Self {
            name,
            policy,
            next_run_offset: Duration::ZERO,
            body: Mutex::new(body),
            inner: Mutex::new(PlanInner {
                state: PlanState::Idle,
                started_runs: 0,
                settled_runs: 0,
                finished_count: 0,
                last_failure: None,
                last_failure_count: 0,
                expected_run_time: None,
                actual_run_time: None,
                last_run_duration: None,
                exhausted: false,
                observers: ObserverSet::new(),
            }),
            idle: Condvar::new(),
        }
    }

    /// Creates a fixed-time plan: the next run is due one `period` after the
    /// previous run actually started.
    pub fn fixed_period(
        name: impl Into<String>,
        period: Duration,
        body: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<Self, PlanError> {
        Self::new(name, SchedulePolicy::FixedPeriod(period), body)
    }

    /// Creates a plan that runs a single time.
    pub fn once(
        name: impl Into<String>,
        body: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self::build(name.into(), SchedulePolicy::Once, Box::new(body))
    }

    /// Delays the first run by `offset` after the plan is scheduled.
    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.next_run_offset = offset;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    pub fn next_run_offset(&self) -> Duration {
        self.next_run_offset
    }

    /// Runs the plan's body once on the calling thread.
    ///
    /// Returns `PlanError::AlreadyRunning` if another run is in flight.
    pub fn run(&self) -> Result<(), PlanError> {
        self.run_if(|| true).map(|_| ())
    }

    /// Runs the plan unless `gate` returns `false`.
    ///
    /// `gate` is evaluated under the plan's lock, in the same critical section
    /// that moves the plan to `Running`. Returns `Ok(false)` if the gate refused.
    pub(crate) fn run_if(&self, gate: impl FnOnce() -> bool) -> Result<bool, PlanError> {
        let (observers, run, expected, actual) = {
            let mut inner = self.inner.lock();
            if inner.state == PlanState::Running {
                return Err(PlanError::AlreadyRunning(self.name.clone()));
            }
            if !gate() {
                return Ok(false);
            }
            let actual = time::now();
            inner.state = PlanState::Running;
            inner.started_runs += 1;
            inner.actual_run_time = Some(actual);
            (
                inner.observers.snapshot(),
                inner.finished_count + 1,
                inner.expected_run_time,
                actual,
            )
        };
        debug!(plan = %self.name, run, "Plan run starting.");
        notify(&observers, "plan.run", |observer| {
            observer.on_run(self, run, expected, actual)
        });

        let (failure, took) = {
            let mut body = self.body.lock();
            TimeMeasurer::measure(|| capture(|| (&mut *body)()))
        };
        if let Some(failure) = &failure {
            warn!(plan = %self.name, run, "Plan body failed: {}", failure);
        }
        let failure = failure.map(Arc::new);

        let (observers, finished_count) = {
            let mut inner = self.inner.lock();
            match &failure {
                Some(failure) => {
                    inner.last_failure = Some(Arc::clone(failure));
                    inner.last_failure_count += 1;
                }
                None => {
                    inner.last_failure = None;
                    inner.last_failure_count = 0;
                }
            }
            inner.finished_count += 1;
            inner.expected_run_time = self.policy.next_run_time(inner.actual_run_time);
            inner.exhausted = inner.expected_run_time.is_none();
            inner.last_run_duration = Some(took);
            inner.state = PlanState::Idle;
            (inner.observers.snapshot(), inner.finished_count)
        };
        debug!(plan = %self.name, finished_count, ?took, "Plan run finished.");
        notify(&observers, "plan.finished", |observer| {
            observer.on_finished(self, finished_count, failure.as_deref())
        });

        self.inner.lock().settled_runs += 1;
        self.idle.notify_all();
        Ok(true)
    }

    pub fn state(&self) -> PlanState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == PlanState::Running
    }

    /// Number of completed runs, successful or not.
    pub fn finished_count(&self) -> u64 {
        self.inner.lock().finished_count
    }

    /// The failure of the most recent run, if that run failed.
    pub fn last_failure(&self) -> Option<Arc<Failure>> {
        self.inner.lock().last_failure.clone()
    }

    /// Number of consecutive failing runs, ending with the most recent one.
    pub fn last_failure_count(&self) -> u64 {
        self.inner.lock().last_failure_count
    }

    /// When the next run is due. `None` before the first run and after the
    /// policy has run out.
    pub fn expected_run_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().expected_run_time
    }

    /// When the most recent run actually started.
    pub fn actual_run_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().actual_run_time
    }

    pub fn last_run_duration(&self) -> Option<Duration> {
        self.inner.lock().last_run_duration
    }

    /// `true` once the policy has no further runs to offer.
    pub fn is_exhausted(&self) -> bool {
        self.inner.lock().exhausted
    }

    pub fn stats(&self) -> PlanStats {
        let inner = self.inner.lock();
        PlanStats {
            name: self.name.clone(),
            state: inner.state,
            finished_count: inner.finished_count,
            last_failure_count: inner.last_failure_count,
            expected_run_time: inner.expected_run_time,
            actual_run_time: inner.actual_run_time,
            last_run_duration: inner.last_run_duration,
            exhausted: inner.exhausted,
        }
    }

    /// Blocks until the run in flight, if any, has finished.
    pub fn await_finish(&self) {
        let mut inner = self.inner.lock();
        let target = inner.started_runs;
        while inner.settled_runs < target {
            self.idle.wait(&mut inner);
        }
    }

    /// Like [`Plan::await_finish`], giving up after `timeout`.
    ///
    /// Returns `true` if no run was in flight or it finished in time.
    pub fn await_finish_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let target = inner.started_runs;
        while inner.settled_runs < target {
            if self.idle.wait_until(&mut inner, deadline).timed_out() {
                return inner.settled_runs >= target;
            }
        }
        true
    }

    pub fn add_observer(&self, observer: Arc<dyn PlanObserver>) -> bool {
        self.inner.lock().observers.add(observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn PlanObserver>) -> bool {
        self.inner.lock().observers.remove(observer)
    }

    pub fn clear_observers(&self) {
        self.inner.lock().observers.clear();
    }

    /// Locks the plan's state for external coordination.
    ///
    /// No run can start or finish while the guard is held. Do not wait on
    /// another instance while holding it.
    pub fn lock(&self) -> PlanLock<'_> {
        PlanLock {
            inner: self.inner.lock(),
        }
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("next_run_offset", &self.next_run_offset)
            .finish_non_exhaustive()
    }
}

/// Read access to a [`Plan`]'s state while its lock is held.
pub struct PlanLock<'a> {
    inner: MutexGuard<'a, PlanInner>,
}

impl PlanLock<'_> {
    pub fn state(&self) -> PlanState {
        self.inner.state
    }

    pub fn finished_count(&self) -> u64 {
        self.inner.finished_count
    }

    pub fn last_failure_count(&self) -> u64 {
        self.inner.last_failure_count
    }

    pub fn expected_run_time(&self) -> Option<DateTime<Utc>> {
        self.inner.expected_run_time
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }
}
