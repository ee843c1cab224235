use anyhow::Result;
use cadence::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // 2. Load the configuration. A missing file falls back to the defaults.
    let path = std::env::args().nth(1).unwrap_or_else(|| "cadence.toml".to_string());
    let config = CadenceConfig::load(&path)?;
    info!("Loaded configuration from '{}' ({} plans).", path, config.plans.len());

    // 3. Create the timer.
    let timer = ListTimer::new(config.timer.clone());

    // 4. Follow the timer's event stream on a separate task.
    spawn_event_listener(&timer);

    // 5. Register plans and a chain of blocked tasks.
    register_plans(&timer, &config.plans)?;
    run_task_chain()?;

    // 6. Run until Ctrl+C, then stop every plan and wait for the drivers.
    info!(
        "{} v{} running. Press Ctrl+C to shut down.",
        cadence::ENGINE_NAME,
        cadence::VERSION
    );
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Terminating timer...");
    timer.terminate();
    let waiter = timer.clone();
    let terminated = tokio::task::spawn_blocking(move || {
        waiter.await_termination_timeout(Duration::from_secs(10))
    })
    .await?;
    if !terminated {
        warn!("Some plans were still running after 10s.");
    }
    Ok(())
}

/// Logs every event broadcast by the timer.
fn spawn_event_listener(timer: &ListTimer) {
    let mut events = timer.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TimerEvent::PlanFinished {
                    name,
                    finished_count,
                    failure: Some(failure),
                    ..
                } => warn!("[PLAN] {} run #{} failed: {}", name, finished_count, failure),
                TimerEvent::PlanRan { .. } | TimerEvent::PlanFinished { .. } => {}
                other => info!("[TIMER] => {:?}", other),
            }
        }
    });
}

/// Schedules the configured plans, or a small default set if there are none.
fn register_plans(timer: &ListTimer, plans: &[PlanConfig]) -> Result<()> {
    let defaults;
    let plans = if plans.is_empty() {
        defaults = default_plans();
        defaults.as_slice()
    } else {
        plans
    };

    for definition in plans {
        let counter = Arc::new(AtomicU64::new(0));
        let name = definition.name.clone();
        let plan = Arc::new(definition.build(move || {
            let run = counter.fetch_add(1, Ordering::Relaxed) + 1;
            info!("[{}] run #{}", name, run);
            Ok(())
        })?);
        timer.schedule(&plan)?;
    }

    // A plan that fails every third run, to show failure accounting.
    let flaky_runs = AtomicU64::new(0);
    let flaky = Arc::new(Plan::fixed_period("flaky", Duration::from_secs(3), move || {
        let run = flaky_runs.fetch_add(1, Ordering::Relaxed) + 1;
        if run % 3 == 0 {
            anyhow::bail!("simulated failure on run {}", run);
        }
        Ok(())
    })?);
    timer.schedule(&flaky)?;
    Ok(())
}

fn default_plans() -> Vec<PlanConfig> {
    vec![
        PlanConfig {
            name: "heartbeat".to_string(),
            period_ms: 2_000,
            offset_ms: 0,
            once: false,
            until: None,
        },
        PlanConfig {
            name: "warmup".to_string(),
            period_ms: 1_000,
            offset_ms: 500,
            once: true,
            until: None,
        },
    ]
}

/// Runs a target task that waits for two prerequisites, each on its own thread.
fn run_task_chain() -> Result<()> {
    let fetch = Arc::new(Task::new("fetch", || {
        std::thread::sleep(Duration::from_millis(300));
        info!("[TASK] fetch done");
        Ok(())
    }));
    let index = Arc::new(Task::new("index", || {
        std::thread::sleep(Duration::from_millis(100));
        info!("[TASK] index done");
        Ok(())
    }));
    let publish = Arc::new(BlockedTask::new(
        Arc::new(Task::new("publish", || {
            info!("[TASK] publish ran after its prerequisites");
            Ok(())
        })),
        vec![Arc::clone(&fetch), Arc::clone(&index)],
    ));

    publish.spawn()?;
    fetch.spawn()?;
    index.spawn()?;
    Ok(())
}
