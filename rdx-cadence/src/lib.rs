//! # Cadence
//!
//! A thread-driven execution engine for one-shot tasks and recurring plans.
//!
//! Cadence manages the lifecycle of units of work that run on caller-managed
//! threads. It tracks their state under per-instance locks, notifies observers
//! as they move through their lifecycle, and lets other threads block until
//! they finish.
//!
//! ## Core Concepts
//!
//! - **Task**: A one-shot unit of work. It moves from `NotStarted` to `Started`
//!   to `Finished` exactly once, and any failure of its body is captured
//!   instead of propagated.
//! - **Plan**: A recurring unit of work. Each run moves it from `Idle` to
//!   `Running` and back, updating its counters and computing the next due time
//!   from its `SchedulePolicy`.
//! - **ListTimer**: A registry of plans. Every scheduled plan gets a dedicated
//!   driver thread that sleeps until the plan is due and then runs it.
//! - **MapReusePool**: A map from elements to reuse conditions, with a batch
//!   operator for applying signals and evicting elements that no longer
//!   qualify.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cadence::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     // 1. Create a timer with the default configuration.
//!     let timer = ListTimer::new(TimerConfig::default());
//!
//!     // 2. Build a plan that runs every 500ms.
//!     let plan = Arc::new(Plan::fixed_period("heartbeat", Duration::from_millis(500), || {
//!         println!("still alive");
//!         Ok(())
//!     })?);
//!
//!     // 3. Hand it to the timer, which spawns its driver thread.
//!     timer.schedule(&plan)?;
//!
//!     // 4. Later, stop everything and wait for the drivers to exit.
//!     std::thread::sleep(Duration::from_secs(2));
//!     timer.terminate();
//!     timer.await_termination();
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Cadence";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod common;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod time;

/// A prelude module for easy importing of the most common Cadence types.
pub mod prelude {
    pub use crate::common::PlanKey;
    pub use crate::components::observer::{PlanObserver, TaskObserver, TimerObserver};
    pub use crate::components::plan::{Plan, PlanState, PlanStats, SchedulePolicy};
    pub use crate::components::pool::{
        BatchOperator, Condition, CountCondition, CountSignal, IdleCondition, IdleSignal,
        MapReusePool,
    };
    pub use crate::components::task::{BlockedTask, Task, TaskState};
    pub use crate::config::{CadenceConfig, PlanConfig, TimerConfig};
    pub use crate::engine::ListTimer;
    pub use crate::error::{Failure, PlanError, TaskError, TimerError};
    pub use crate::events::TimerEvent;
    pub use crate::time::TimeMeasurer;
}
