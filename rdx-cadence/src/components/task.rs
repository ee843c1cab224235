//! One-shot tasks and the blocked-task decorator.

use crate::common::TaskBody;
use crate::components::observer::{notify, ObserverSet, TaskObserver};
use crate::error::{capture, Failure, TaskError};
use crate::time::TimeMeasurer;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// The lifecycle of a [`Task`]. It only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    NotStarted,
    Started,
    Finished,
}

struct TaskInner {
    state: TaskState,
    /// Set once the finished event has been delivered; waiters park on this.
    released: bool,
    failure: Option<Arc<Failure>>,
    elapsed: Option<Duration>,
    observers: ObserverSet<dyn TaskObserver>,
}

/// A one-shot unit of work.
///
/// A task runs on whichever thread calls [`Task::run`]. Its body executes at
/// most once; an error or panic from the body is captured and kept as the
/// task's failure instead of being propagated.
pub struct Task {
    name: String,
    body: Mutex<Option<TaskBody>>,
    inner: Mutex<TaskInner>,
    finished: Condvar,
}

impl Task {
    /// Creates a task that has not started yet.
    pub fn new(
        name: impl Into<String>,
        body: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: Mutex::new(Some(Box::new(body))),
            inner: Mutex::new(TaskInner {
                state: TaskState::NotStarted,
                released: false,
                failure: None,
                elapsed: None,
                observers: ObserverSet::new(),
            }),
            finished: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executes the task on the calling thread.
    ///
    /// Returns `TaskError::AlreadyStarted` if the task is not in the
    /// `NotStarted` state. Failures of the body are never returned here; see
    /// [`Task::failure`].
    pub fn run(&self) -> Result<(), TaskError> {
        let observers = {
            let mut inner = self.inner.lock();
            if inner.state != TaskState::NotStarted {
                return Err(TaskError::AlreadyStarted(self.name.clone()));
            }
            inner.state = TaskState::Started;
            inner.observers.snapshot()
        };
        debug!(task = %self.name, "Task started.");
        notify(&observers, "task.started", |observer| observer.on_started(self));

        let body = self.body.lock().take();
        let (failure, elapsed) = TimeMeasurer::measure(|| body.and_then(capture));
        if let Some(failure) = &failure {
            warn!(task = %self.name, "Task body failed: {}", failure);
        }
        let failure = failure.map(Arc::new);

        let observers = {
            let mut inner = self.inner.lock();
            inner.state = TaskState::Finished;
            inner.failure = failure.clone();
            inner.elapsed = Some(elapsed);
            inner.observers.snapshot()
        };
        debug!(task = %self.name, ?elapsed, "Task finished.");
        notify(&observers, "task.finished", |observer| {
            observer.on_finished(self, failure.as_deref())
        });

        self.inner.lock().released = true;
        self.finished.notify_all();
        Ok(())
    }

    /// Runs the task on a new named thread.
    pub fn spawn(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let task = Arc::clone(self);
        spawn_named(&self.name, move || {
            if let Err(err) = task.run() {
                warn!("{}", err);
            }
        })
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn is_started(&self) -> bool {
        self.state() != TaskState::NotStarted
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// The failure captured from the body, if any. Valid in every state.
    pub fn failure(&self) -> Option<Arc<Failure>> {
        self.inner.lock().failure.clone()
    }

    /// How long the body took, once the task has finished.
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner.lock().elapsed
    }

    /// Blocks until the task has finished. Returns at once if it already has.
    pub fn await_finish(&self) {
        let mut inner = self.inner.lock();
        while !inner.released {
            self.finished.wait(&mut inner);
        }
    }

    /// Blocks until the task has finished or `timeout` elapses.
    ///
    /// Returns `true` if the task finished in time.
    pub fn await_finish_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.released {
            if self.finished.wait_until(&mut inner, deadline).timed_out() {
                return inner.released;
            }
        }
        true
    }

    pub fn add_observer(&self, observer: Arc<dyn TaskObserver>) -> bool {
        self.inner.lock().observers.add(observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn TaskObserver>) -> bool {
        self.inner.lock().observers.remove(observer)
    }

    pub fn clear_observers(&self) {
        self.inner.lock().observers.clear();
    }

    /// Locks the task's state for external coordination.
    ///
    /// The task cannot change state while the guard is held. Do not wait on
    /// another instance while holding it.
    pub fn lock(&self) -> TaskLock<'_> {
        TaskLock {
            inner: self.inner.lock(),
        }
    }
}

/// Read access to a [`Task`]'s state while its lock is held.
pub struct TaskLock<'a> {
    inner: MutexGuard<'a, TaskInner>,
}

impl TaskLock<'_> {
    pub fn state(&self) -> TaskState {
        self.inner.state
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.inner.failure.as_deref()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }
}

/// A task that waits for a list of prerequisite tasks before running its target.
///
/// The blocked task counts as started as soon as `run` is entered, while it
/// is still waiting on its prerequisites. Prerequisites are awaited in order.
pub struct BlockedTask {
    target: Arc<Task>,
    prerequisites: Vec<Arc<Task>>,
    entered: AtomicBool,
}

impl BlockedTask {
    pub fn new(target: Arc<Task>, prerequisites: Vec<Arc<Task>>) -> Self {
        Self {
            target,
            prerequisites,
            entered: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.target.name()
    }

    pub fn target(&self) -> &Arc<Task> {
        &self.target
    }

    pub fn prerequisites(&self) -> &[Arc<Task>] {
        &self.prerequisites
    }

    /// Waits for every prerequisite to finish, then runs the target.
    pub fn run(&self) -> Result<(), TaskError> {
        if self.entered.swap(true, Ordering::SeqCst) || self.target.is_started() {
            return Err(TaskError::AlreadyStarted(self.target.name.clone()));
        }
        for prerequisite in &self.prerequisites {
            trace!(
                task = %self.target.name,
                prerequisite = %prerequisite.name,
                "Waiting on prerequisite."
            );
            prerequisite.await_finish();
        }
        self.target.run()
    }

    pub fn spawn(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let task = Arc::clone(self);
        spawn_named(self.name(), move || {
            if let Err(err) = task.run() {
                warn!("{}", err);
            }
        })
    }

    pub fn is_started(&self) -> bool {
        self.entered.load(Ordering::SeqCst) || self.target.is_started()
    }

    pub fn is_finished(&self) -> bool {
        self.target.is_finished()
    }

    pub fn failure(&self) -> Option<Arc<Failure>> {
        self.target.failure()
    }

    pub fn await_finish(&self) {
        self.target.await_finish();
    }

    pub fn await_finish_timeout(&self, timeout: Duration) -> bool {
        self.target.await_finish_timeout(timeout)
    }

    /// Observers are registered on the target task.
    pub fn add_observer(&self, observer: Arc<dyn TaskObserver>) -> bool {
        self.target.add_observer(observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn TaskObserver>) -> bool {
        self.target.remove_observer(observer)
    }

    pub fn clear_observers(&self) {
        self.target.clear_observers();
    }
}

fn spawn_named(name: &str, work: impl FnOnce() + Send + 'static) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("task-{}", name))
        .spawn(work)
}
