//! The `ListTimer`: a registry of plans, each driven on its own thread.

use crate::common::PlanKey;
use crate::components::observer::{notify, ObserverSet, PlanObserver, TimerObserver};
use crate::components::plan::Plan;
use crate::config::TimerConfig;
use crate::error::{Failure, TimerError};
use crate::events::TimerEvent;
use crate::time;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use slotmap::SlotMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// A registry of recurring plans.
///
/// Every scheduled plan gets a dedicated driver thread that sleeps until the
/// plan is due, runs it, reads the plan's next due time and repeats. A plan
/// leaves the registry when it is removed, when the timer is cleared, or when
/// its policy has no further runs. Removal never interrupts a run in flight.
///
/// The timer is a cheap handle and can be cloned and shared across threads.
/// When the last handle is dropped the timer is terminated: every plan is
/// removed and the driver threads exit after any run in flight.
#[derive(Clone)]
pub struct ListTimer {
    shared: Arc<Shared>,
    _last_handle: Arc<LastHandle>,
}

/// Terminates the timer once no `ListTimer` handle is left. Drivers hold
/// `Shared` directly, so they do not keep this alive.
struct LastHandle(Arc<Shared>);

impl Drop for LastHandle {
    fn drop(&mut self) {
        let shared = &self.0;
        let idle = {
            let registry = shared.registry.lock();
            registry.shutdown && registry.plans.is_empty()
        };
        if !idle {
            debug!("Last ListTimer handle dropped; terminating.");
            shared.shutdown();
            shared.clear();
        }
    }
}

struct Shared {
    config: TimerConfig,
    registry: Mutex<Registry>,
    terminated: Condvar,
    /// Serializes event delivery so registry events reach observers in the
    /// order the registry changed. Reentrant so observers may call back in.
    dispatch: ReentrantMutex<()>,
    event_sender: broadcast::Sender<TimerEvent>,
}

struct Registry {
    plans: SlotMap<PlanKey, Registration>,
    shutdown: bool,
    live_drivers: usize,
    termination_announced: bool,
    observers: ObserverSet<dyn TimerObserver>,
}

impl Registry {
    fn key_of(&self, plan: &Arc<Plan>) -> Option<PlanKey> {
        self.plans
            .iter()
            .find(|(_, registration)| Arc::ptr_eq(&registration.plan, plan))
            .map(|(key, _)| key)
    }

    fn is_terminated(&self) -> bool {
        self.shutdown && self.live_drivers == 0
    }
}

struct Registration {
    plan: Arc<Plan>,
    signal: Arc<DriverSignal>,
    relay: Arc<dyn PlanObserver>,
}

impl Registration {
    /// Stops the driver and detaches the timer's relay from the plan.
    ///
    /// The stop lands before the plan's lock is taken, so once this returns
    /// the driver either started its run already or will not start one.
    fn release(&self) {
        self.signal.stop();
        self.plan.remove_observer(&self.relay);
    }
}

/// Wakes a sleeping driver when its plan leaves the registry.
struct DriverSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl DriverSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps until `due`. Returns `true` if the driver was stopped instead.
    fn sleep_until(&self, due: DateTime<Utc>) -> bool {
        let mut stopped = self.stopped.lock();
        loop {
            if *stopped {
                return true;
            }
            let remaining = time::until(due);
            if remaining.is_zero() {
                return false;
            }
            self.wake.wait_for(&mut stopped, remaining);
        }
    }
}

/// Forwards a scheduled plan's run events onto the timer's event channel.
struct PlanRelay {
    key: PlanKey,
    events: broadcast::Sender<TimerEvent>,
}

impl PlanObserver for PlanRelay {
    fn on_run(
        &self,
        plan: &Plan,
        run: u64,
        expected: Option<DateTime<Utc>>,
        actual: DateTime<Utc>,
    ) {
        self.events
            .send(TimerEvent::PlanRan {
                key: self.key,
                name: plan.name().to_string(),
                run,
                expected,
                actual,
            })
            .ok();
    }

    fn on_finished(&self, plan: &Plan, finished_count: u64, failure: Option<&Failure>) {
        self.events
            .send(TimerEvent::PlanFinished {
                key: self.key,
                name: plan.name().to_string(),
                finished_count,
                failure: failure.map(ToString::to_string),
            })
            .ok();
    }
}

// Core implementation block for internal logic.
impl Shared {
    /// Delivers an event to the timer observers and the broadcast channel.
    /// Callers hold the dispatch lock.
    fn publish(
        &self,
        name: &'static str,
        event: TimerEvent,
        deliver: impl FnMut(&(dyn TimerObserver + 'static)),
    ) {
        let observers = self.registry.lock().observers.snapshot();
        notify(&observers, name, deliver);
        self.event_sender.send(event).ok();
    }

    /// Removes a plan on the timer's own initiative, unless a caller removed it first.
    fn retire(&self, key: PlanKey) {
        let _dispatch = self.dispatch.lock();
        let Some(registration) = self.registry.lock().plans.remove(key) else {
            return;
        };
        registration.release();
        debug!(plan = %registration.plan.name(), "Plan retired.");
        self.publish(
            "timer.removed",
            TimerEvent::PlanRemoved {
                key,
                name: registration.plan.name().to_string(),
            },
            |observer| observer.on_removed(key, &registration.plan),
        );
    }

    fn clear(&self) {
        let _dispatch = self.dispatch.lock();
        let drained: Vec<Registration> = {
            let mut registry = self.registry.lock();
            registry.plans.drain().map(|(_, registration)| registration).collect()
        };
        for registration in &drained {
            registration.release();
        }
        debug!(removed = drained.len(), "Timer cleared.");
        self.publish(
            "timer.cleared",
            TimerEvent::Cleared {
                removed: drained.len(),
            },
            |observer| observer.on_cleared(),
        );
    }

    fn shutdown(&self) {
        {
            let _dispatch = self.dispatch.lock();
            {
                let mut registry = self.registry.lock();
                if registry.shutdown {
                    return;
                }
                registry.shutdown = true;
            }
            info!("ListTimer shutting down; no new plans will be accepted.");
            self.publish("timer.shutdown", TimerEvent::Shutdown, |observer| {
                observer.on_shutdown()
            });
        }
        self.announce_termination();
    }

    fn driver_exited(&self) {
        self.registry.lock().live_drivers -= 1;
        self.announce_termination();
    }

    /// Fires the terminated event once the timer is shut down and idle.
    fn announce_termination(&self) {
        let announce = {
            let mut registry = self.registry.lock();
            if registry.is_terminated() && !registry.termination_announced {
                registry.termination_announced = true;
                true
            } else {
                false
            }
        };
        if announce {
            let _dispatch = self.dispatch.lock();
            info!("ListTimer has terminated.");
            self.publish("timer.terminated", TimerEvent::Terminated, |observer| {
                observer.on_terminated()
            });
        }
        self.terminated.notify_all();
    }
}

/// The loop run by each driver thread.
fn drive(shared: Arc<Shared>, key: PlanKey, plan: Arc<Plan>, signal: Arc<DriverSignal>) {
    debug!(plan = %plan.name(), "Driver started.");
    // A plan that has run before keeps its cadence; a fresh one starts after its offset.
    let mut next = match plan.expected_run_time() {
        Some(expected) => Some(expected),
        None if plan.is_exhausted() => None,
        None => Some(time::add(time::now(), plan.next_run_offset())),
    };
    while let Some(due) = next {
        trace!(plan = %plan.name(), %due, "Driver waiting for next run.");
        if signal.sleep_until(due) {
            break;
        }
        match plan.run_if(|| !signal.is_stopped()) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                // Someone else is running the plan; let that run stand in for ours.
                warn!("{}", err);
                plan.await_finish();
            }
        }
        if signal.is_stopped() {
            break;
        }
        next = plan.expected_run_time();
    }
    if next.is_none() {
        shared.retire(key);
    }
    debug!(plan = %plan.name(), "Driver exited.");
    shared.driver_exited();
}

// Public API implementation block.
impl ListTimer {
    /// Creates an empty timer with the given configuration.
    pub fn new(config: TimerConfig) -> Self {
        let (event_sender, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            config,
            registry: Mutex::new(Registry {
                plans: SlotMap::with_key(),
                shutdown: false,
                live_drivers: 0,
                termination_announced: false,
                observers: ObserverSet::new(),
            }),
            terminated: Condvar::new(),
            dispatch: ReentrantMutex::new(()),
            event_sender,
        });
        Self {
            _last_handle: Arc::new(LastHandle(Arc::clone(&shared))),
            shared,
        }
    }

    /// Registers a plan and starts its driver thread.
    ///
    /// Returns `Ok(false)` if the plan is already registered, and
    /// `TimerError::Shutdown` once the timer has been shut down.
    pub fn schedule(&self, plan: &Arc<Plan>) -> Result<bool, TimerError> {
        let shared = &self.shared;
        let _dispatch = shared.dispatch.lock();
        let signal = Arc::new(DriverSignal::new());
        let (key, relay) = {
            let mut registry = shared.registry.lock();
            if registry.shutdown {
                return Err(TimerError::Shutdown(plan.name().to_string()));
            }
            if registry.key_of(plan).is_some() {
                return Ok(false);
            }
            let key = registry.plans.insert_with_key(|key| Registration {
                plan: Arc::clone(plan),
                signal: Arc::clone(&signal),
                relay: Arc::new(PlanRelay {
                    key,
                    events: shared.event_sender.clone(),
                }),
            });
            registry.live_drivers += 1;
            (key, Arc::clone(&registry.plans[key].relay))
        };
        plan.add_observer(relay);

        debug!(plan = %plan.name(), ?key, "Plan scheduled.");
        shared.publish(
            "timer.scheduled",
            TimerEvent::PlanScheduled {
                key,
                name: plan.name().to_string(),
            },
            |observer| observer.on_scheduled(key, plan),
        );

        let spawned = {
            let shared = Arc::clone(shared);
            let plan = Arc::clone(plan);
            thread::Builder::new()
                .name(format!("{}-{}", shared.config.thread_prefix, plan.name()))
                .spawn(move || drive(shared, key, plan, signal))
        };
        if let Err(err) = spawned {
            error!(plan = %plan.name(), "Failed to start driver: {}", err);
            shared.registry.lock().live_drivers -= 1;
            shared.retire(key);
            shared.announce_termination();
            return Err(TimerError::Spawn {
                plan: plan.name().to_string(),
                reason: err.to_string(),
            });
        }
        Ok(true)
    }

    /// Removes a plan and stops its driver.
    ///
    /// A run in flight completes undisturbed; no further runs start. Returns
    /// `false` if the plan was not registered.
    pub fn remove(&self, plan: &Arc<Plan>) -> bool {
        let shared = &self.shared;
        let _dispatch = shared.dispatch.lock();
        let removed = {
            let mut registry = shared.registry.lock();
            registry
                .key_of(plan)
                .and_then(|key| registry.plans.remove(key).map(|registration| (key, registration)))
        };
        let Some((key, registration)) = removed else {
            return false;
        };
        registration.release();
        debug!(plan = %plan.name(), ?key, "Plan removed.");
        shared.publish(
            "timer.removed",
            TimerEvent::PlanRemoved {
                key,
                name: plan.name().to_string(),
            },
            |observer| observer.on_removed(key, &registration.plan),
        );
        true
    }

    /// Removes every plan, firing a single cleared event.
    pub fn clear(&self) {
        self.shared.clear();
    }

    /// Stops accepting new plans.
    ///
    /// Registered plans keep running until they are removed or their policy
    /// runs out. Nothing is interrupted. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Shuts the timer down and removes every plan.
    pub fn terminate(&self) {
        self.shutdown();
        self.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.registry.lock().shutdown
    }

    /// `true` once the timer is shut down and every driver has exited.
    pub fn is_terminated(&self) -> bool {
        self.shared.registry.lock().is_terminated()
    }

    /// Blocks until the timer is terminated.
    pub fn await_termination(&self) {
        let mut registry = self.shared.registry.lock();
        while !registry.is_terminated() {
            self.shared.terminated.wait(&mut registry);
        }
    }

    /// Blocks until the timer is terminated or `timeout` elapses.
    ///
    /// Returns `true` if the timer terminated in time.
    pub fn await_termination_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.shared.registry.lock();
        while !registry.is_terminated() {
            if self
                .shared
                .terminated
                .wait_until(&mut registry, deadline)
                .timed_out()
            {
                return registry.is_terminated();
            }
        }
        true
    }

    /// A snapshot of the registered plans.
    pub fn plans(&self) -> Vec<Arc<Plan>> {
        self.shared
            .registry
            .lock()
            .plans
            .values()
            .map(|registration| Arc::clone(&registration.plan))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.registry.lock().plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.registry.lock().plans.is_empty()
    }

    pub fn contains(&self, plan: &Arc<Plan>) -> bool {
        self.key_of(plan).is_some()
    }

    /// The registration key of a scheduled plan.
    pub fn key_of(&self, plan: &Arc<Plan>) -> Option<PlanKey> {
        self.shared.registry.lock().key_of(plan)
    }

    pub fn get(&self, key: PlanKey) -> Option<Arc<Plan>> {
        self.shared
            .registry
            .lock()
            .plans
            .get(key)
            .map(|registration| Arc::clone(&registration.plan))
    }

    /// Number of driver threads that have not exited yet.
    pub fn live_drivers(&self) -> usize {
        self.shared.registry.lock().live_drivers
    }

    pub fn config(&self) -> &TimerConfig {
        &self.shared.config
    }

    pub fn add_observer(&self, observer: Arc<dyn TimerObserver>) -> bool {
        self.shared.registry.lock().observers.add(observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn TimerObserver>) -> bool {
        self.shared.registry.lock().observers.remove(observer)
    }

    pub fn clear_observers(&self) {
        self.shared.registry.lock().observers.clear();
    }

    /// Subscribes to the `TimerEvent` stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TimerEvent> {
        self.shared.event_sender.subscribe()
    }
}

impl Default for ListTimer {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}
