use cadence::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

fn idle_plan(name: &str) -> Arc<Plan> {
    Arc::new(Plan::fixed_period(name, Duration::from_secs(60), || Ok(())).unwrap())
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<TimerEvent>) -> Vec<TimerEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return drained,
        }
    }
}

#[test]
fn schedule_and_remove_succeed_once_per_plan() {
    let timer = ListTimer::default();
    let first = idle_plan("first");
    let second = idle_plan("second");

    assert_eq!(timer.schedule(&first), Ok(true));
    assert_eq!(timer.schedule(&first), Ok(false));
    assert_eq!(timer.schedule(&second), Ok(true));
    assert_eq!(timer.plans().len(), 2);
    assert!(timer.contains(&first));

    assert!(timer.remove(&first));
    assert!(!timer.remove(&first));
    assert_eq!(timer.plans().len(), 1);
    assert!(!timer.contains(&first));

    timer.terminate();
    assert!(timer.await_termination_timeout(Duration::from_secs(1)));
}

#[test]
fn concurrent_schedules_of_one_plan_register_it_once() {
    let timer = ListTimer::default();
    let plan = idle_plan("contended");
    let accepted = Arc::new(AtomicUsize::new(0));

    let schedulers: Vec<_> = (0..8)
        .map(|_| {
            let timer = timer.clone();
            let plan = Arc::clone(&plan);
            let accepted = Arc::clone(&accepted);
            thread::spawn(move || {
                if timer.schedule(&plan).unwrap() {
                    accepted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for scheduler in schedulers {
        scheduler.join().unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(timer.len(), 1);
    timer.terminate();
    timer.await_termination();
}

#[test]
fn fixed_time_plan_runs_on_its_period() {
    let timer = ListTimer::default();
    let plan = Arc::new(Plan::fixed_period("metronome", Duration::from_millis(100), || Ok(())).unwrap());

    timer.schedule(&plan).unwrap();
    thread::sleep(Duration::from_millis(330));
    timer.remove(&plan);
    plan.await_finish();

    let runs = plan.finished_count();
    assert!((3..=4).contains(&runs), "unexpected run count {}", runs);
    assert_eq!(plan.last_failure_count(), 0);

    thread::sleep(Duration::from_millis(150));
    assert_eq!(plan.finished_count(), runs);
    timer.terminate();
    timer.await_termination();
}

#[test]
fn offset_delays_the_first_run() {
    let timer = ListTimer::default();
    let plan = Arc::new(
        Plan::fixed_period("delayed", Duration::from_secs(5), || Ok(()))
            .unwrap()
            .with_offset(Duration::from_millis(150)),
    );

    timer.schedule(&plan).unwrap();
    thread::sleep(Duration::from_millis(80));
    assert_eq!(plan.finished_count(), 0);
    thread::sleep(Duration::from_millis(170));
    assert_eq!(plan.finished_count(), 1);

    timer.terminate();
    assert!(timer.await_termination_timeout(Duration::from_secs(1)));
}

#[test]
fn failing_plans_keep_their_driver_alive() {
    let timer = ListTimer::default();
    let plan = Arc::new(
        Plan::fixed_period("broken", Duration::from_millis(40), || anyhow::bail!("always")).unwrap(),
    );

    timer.schedule(&plan).unwrap();
    thread::sleep(Duration::from_millis(200));
    timer.remove(&plan);
    plan.await_finish();

    assert!(plan.finished_count() >= 3);
    assert_eq!(plan.last_failure_count(), plan.finished_count());
    assert_eq!(plan.last_failure().unwrap().to_string(), "always");
    timer.terminate();
    timer.await_termination();
}

#[test]
fn removal_does_not_interrupt_a_run_in_flight() {
    let timer = ListTimer::default();
    let completed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&completed);
    let plan = Arc::new(
        Plan::fixed_period("long", Duration::from_millis(50), move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap(),
    );

    timer.schedule(&plan).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(plan.is_running());
    assert!(timer.remove(&plan));

    plan.await_finish();
    assert!(completed.load(Ordering::SeqCst));
    assert_eq!(plan.finished_count(), 1);

    thread::sleep(Duration::from_millis(120));
    assert_eq!(plan.finished_count(), 1);
    timer.terminate();
    timer.await_termination();
}

#[test]
fn shutdown_rejects_new_plans_and_terminates_once_drained() {
    let timer = ListTimer::default();
    let running = idle_plan("running");
    timer.schedule(&running).unwrap();

    timer.shutdown();
    assert!(timer.is_shutdown());
    assert_eq!(
        timer.schedule(&idle_plan("late")),
        Err(TimerError::Shutdown("late".to_string()))
    );

    // Registered plans survive a shutdown.
    assert!(timer.contains(&running));
    assert!(!timer.is_terminated());
    assert!(!timer.await_termination_timeout(Duration::from_millis(50)));

    timer.clear();
    timer.await_termination();
    assert!(timer.is_terminated());
    assert_eq!(timer.live_drivers(), 0);
}

#[test]
fn an_idle_timer_terminates_as_soon_as_it_shuts_down() {
    let timer = ListTimer::default();
    assert!(!timer.is_terminated());
    timer.shutdown();
    assert!(timer.is_terminated());
    assert!(timer.await_termination_timeout(Duration::ZERO));
}

#[test]
fn one_shot_plans_leave_the_registry_after_running() {
    let timer = ListTimer::default();
    let mut events = timer.subscribe_events();
    let plan = Arc::new(Plan::once("single", || Ok(())));

    timer.schedule(&plan).unwrap();
    let key = timer.key_of(&plan).unwrap();
    thread::sleep(Duration::from_millis(100));

    assert_eq!(plan.finished_count(), 1);
    assert!(timer.is_empty());
    assert!(timer.get(key).is_none());

    let names: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|event| event.plan_key() == Some(key))
        .map(|event| match event {
            TimerEvent::PlanScheduled { .. } => "scheduled",
            TimerEvent::PlanRan { .. } => "ran",
            TimerEvent::PlanFinished { .. } => "finished",
            TimerEvent::PlanRemoved { .. } => "removed",
            _ => "other",
        })
        .collect();
    assert_eq!(names, vec!["scheduled", "ran", "finished", "removed"]);

    timer.shutdown();
    assert!(timer.await_termination_timeout(Duration::from_secs(1)));
}

#[test]
fn scheduled_events_follow_submission_order() {
    let timer = ListTimer::default();
    let mut events = timer.subscribe_events();
    let plans: Vec<_> = (0..5).map(|i| idle_plan(&format!("plan-{}", i))).collect();
    for plan in &plans {
        timer.schedule(plan).unwrap();
    }

    let scheduled: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            TimerEvent::PlanScheduled { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec!["plan-0", "plan-1", "plan-2", "plan-3", "plan-4"]);

    timer.clear();
    let cleared: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, TimerEvent::Cleared { .. }))
        .collect();
    assert_eq!(cleared, vec![TimerEvent::Cleared { removed: 5 }]);

    timer.terminate();
    timer.await_termination();
}

#[derive(Default)]
struct RegistryLog {
    scheduled: AtomicUsize,
    removed: AtomicUsize,
    cleared: AtomicUsize,
    shutdown: AtomicUsize,
    terminated: AtomicUsize,
}

impl TimerObserver for RegistryLog {
    fn on_scheduled(&self, _key: PlanKey, _plan: &Arc<Plan>) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
    }

    fn on_removed(&self, _key: PlanKey, _plan: &Arc<Plan>) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_cleared(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn on_shutdown(&self) {
        self.shutdown.fetch_add(1, Ordering::SeqCst);
    }

    fn on_terminated(&self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

struct PanickingObserver;

impl TimerObserver for PanickingObserver {
    fn on_scheduled(&self, _key: PlanKey, _plan: &Arc<Plan>) {
        panic!("observer bug");
    }
}

#[test]
fn timer_observers_follow_the_registry() {
    let timer = ListTimer::default();
    let log = Arc::new(RegistryLog::default());
    timer.add_observer(Arc::new(PanickingObserver));
    timer.add_observer(log.clone());

    let kept = idle_plan("kept");
    let dropped = idle_plan("dropped");
    timer.schedule(&kept).unwrap();
    timer.schedule(&dropped).unwrap();
    timer.remove(&dropped);
    timer.clear();
    timer.shutdown();
    timer.shutdown();
    timer.await_termination();

    assert_eq!(log.scheduled.load(Ordering::SeqCst), 2);
    assert_eq!(log.removed.load(Ordering::SeqCst), 1);
    assert_eq!(log.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(log.shutdown.load(Ordering::SeqCst), 1);

    // The terminated event fires from the last exiting driver.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(log.terminated.load(Ordering::SeqCst), 1);
}

#[test]
fn removal_detaches_the_timer_from_the_plan() {
    let timer = ListTimer::default();
    let plan = idle_plan("detached");

    timer.schedule(&plan).unwrap();
    assert_eq!(plan.lock().observer_count(), 1);
    timer.remove(&plan);
    assert_eq!(plan.lock().observer_count(), 0);

    timer.terminate();
    timer.await_termination();
}

#[test]
fn observers_may_call_back_into_the_timer() {
    struct Evictor {
        timer: ListTimer,
    }

    impl TimerObserver for Evictor {
        fn on_scheduled(&self, _key: PlanKey, plan: &Arc<Plan>) {
            if plan.name() == "evict-me" {
                self.timer.remove(plan);
            }
        }
    }

    let timer = ListTimer::default();
    timer.add_observer(Arc::new(Evictor {
        timer: timer.clone(),
    }));

    let plan = idle_plan("evict-me");
    assert_eq!(timer.schedule(&plan), Ok(true));
    assert!(!timer.contains(&plan));

    timer.clear_observers();
    timer.terminate();
    assert!(timer.await_termination_timeout(Duration::from_secs(1)));
}

#[test]
fn no_run_starts_once_removal_returns() {
    let timer = ListTimer::default();
    for _ in 0..200 {
        let plan = Arc::new(Plan::fixed_period("spinning", Duration::from_nanos(1), || Ok(())).unwrap());
        timer.schedule(&plan).unwrap();
        thread::sleep(Duration::from_micros(200));

        assert!(timer.remove(&plan));
        plan.await_finish();
        let settled = plan.finished_count();
        thread::sleep(Duration::from_millis(1));
        assert_eq!(plan.finished_count(), settled);
        assert!(!plan.is_running());
    }
    timer.terminate();
    assert!(timer.await_termination_timeout(Duration::from_secs(1)));
}

#[test]
fn rescheduled_plans_keep_their_cadence() {
    let timer = ListTimer::default();
    let plan = Arc::new(Plan::fixed_period("steady", Duration::from_millis(500), || Ok(())).unwrap());

    timer.schedule(&plan).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(plan.finished_count(), 1);
    let due = plan.expected_run_time();

    assert!(timer.remove(&plan));
    plan.await_finish();
    assert_eq!(timer.schedule(&plan), Ok(true));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(plan.finished_count(), 1);
    assert_eq!(plan.expected_run_time(), due);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(plan.finished_count(), 2);
    timer.terminate();
    timer.await_termination();
}

#[test]
fn plans_run_by_hand_wait_for_their_next_due_time() {
    let timer = ListTimer::default();
    let plan = Arc::new(Plan::fixed_period("manual", Duration::from_millis(400), || Ok(())).unwrap());
    plan.run().unwrap();

    timer.schedule(&plan).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(plan.finished_count(), 1);

    timer.terminate();
    timer.await_termination();
}

#[test]
fn spent_one_shot_plans_are_retired_without_running() {
    let timer = ListTimer::default();
    let plan = Arc::new(Plan::once("spent", || Ok(())));
    plan.run().unwrap();

    assert_eq!(timer.schedule(&plan), Ok(true));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(plan.finished_count(), 1);
    assert!(timer.is_empty());

    timer.shutdown();
    assert!(timer.await_termination_timeout(Duration::from_secs(1)));
}

#[test]
fn timer_observers_are_registered_once() {
    let timer = ListTimer::default();
    let observer: Arc<dyn TimerObserver> = Arc::new(RegistryLog::default());

    assert!(timer.add_observer(Arc::clone(&observer)));
    assert!(!timer.add_observer(Arc::clone(&observer)));
    assert!(timer.remove_observer(&observer));
    assert!(!timer.remove_observer(&observer));
}

#[test]
fn dropping_the_last_handle_terminates_the_timer() {
    let log = Arc::new(RegistryLog::default());
    let plan = Arc::new(Plan::fixed_period("orphan", Duration::from_millis(20), || Ok(())).unwrap());
    {
        let timer = ListTimer::default();
        timer.add_observer(log.clone());
        let other = timer.clone();
        timer.schedule(&plan).unwrap();
        thread::sleep(Duration::from_millis(50));

        drop(timer);
        assert!(other.contains(&plan));
        assert_eq!(log.shutdown.load(Ordering::SeqCst), 0);
    }

    plan.await_finish();
    let settled = plan.finished_count();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(plan.finished_count(), settled);
    assert_eq!(plan.lock().observer_count(), 0);
    assert_eq!(log.shutdown.load(Ordering::SeqCst), 1);
    assert_eq!(log.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(log.terminated.load(Ordering::SeqCst), 1);
}
