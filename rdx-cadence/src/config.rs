//! Defines all configuration structures for Cadence.
//!
//! These structs are deserialized with `serde` from a TOML file, layered with
//! `CADENCE__*` environment overrides through the `config` crate. The timer's
//! own settings live under `[timer]`; `[[plans]]` entries describe plans that a
//! host binary schedules at startup.

use crate::components::plan::{Plan, SchedulePolicy};
use crate::error::PlanError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// The top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CadenceConfig {
    /// Settings for the `ListTimer`.
    #[serde(default)]
    pub timer: TimerConfig,

    /// Plans to schedule at startup.
    #[serde(default)]
    pub plans: Vec<PlanConfig>,
}

/// Settings for a `ListTimer`.
#[derive(Debug, Clone, Deserialize)]
pub struct TimerConfig {
    /// Prefix for driver thread names. The plan name is appended.
    #[serde(default = "default_thread_prefix")]
    pub thread_prefix: String,

    /// Capacity of the broadcast channel carrying `TimerEvent`s. Slow
    /// subscribers that fall further behind than this lose the oldest events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// A declarative plan definition.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    /// A human-readable name, used for logging and thread names.
    pub name: String,

    /// Time between runs, measured from the start of the previous run.
    pub period_ms: u64,

    /// Delay before the first run, once scheduled.
    #[serde(default)]
    pub offset_ms: u64,

    /// Run a single time instead of repeating.
    #[serde(default)]
    pub once: bool,

    /// Stop repeating once the next run would land after this instant.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl CadenceConfig {
    /// Loads the configuration from `path`, if it exists, then applies
    /// `CADENCE__*` environment overrides (e.g. `CADENCE__TIMER__EVENT_CAPACITY`).
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("CADENCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parses the configuration from a TOML document.
    pub fn from_toml(source: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

impl PlanConfig {
    pub fn policy(&self) -> SchedulePolicy {
        let period = Duration::from_millis(self.period_ms);
        match (self.once, self.until) {
            (true, _) => SchedulePolicy::Once,
            (false, Some(deadline)) => SchedulePolicy::Until { period, deadline },
            (false, None) => SchedulePolicy::FixedPeriod(period),
        }
    }

    /// Builds a plan from this definition with the given body.
    pub fn build(
        &self,
        body: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<Plan, PlanError> {
        Ok(Plan::new(self.name.clone(), self.policy(), body)?
            .with_offset(Duration::from_millis(self.offset_ms)))
    }
}

// --- Default value functions for serde ---

fn default_thread_prefix() -> String {
    "cadence".to_string()
}

fn default_event_capacity() -> usize {
    64
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            thread_prefix: default_thread_prefix(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = CadenceConfig::from_toml("").unwrap();
        assert_eq!(config.timer.thread_prefix, "cadence");
        assert_eq!(config.timer.event_capacity, 64);
        assert!(config.plans.is_empty());
    }

    #[test]
    fn plans_and_timer_settings_are_parsed() {
        let config = CadenceConfig::from_toml(
            r#"
            [timer]
            thread_prefix = "worker"
            event_capacity = 8

            [[plans]]
            name = "heartbeat"
            period_ms = 250

            [[plans]]
            name = "warmup"
            period_ms = 1000
            offset_ms = 50
            once = true

            [[plans]]
            name = "campaign"
            period_ms = 500
            until = "2030-01-01T00:00:00Z"
            "#,
        )
        .unwrap();

        assert_eq!(config.timer.thread_prefix, "worker");
        assert_eq!(config.timer.event_capacity, 8);
        assert_eq!(config.plans.len(), 3);

        assert_eq!(
            config.plans[0].policy(),
            SchedulePolicy::FixedPeriod(Duration::from_millis(250))
        );
        assert_eq!(config.plans[1].policy(), SchedulePolicy::Once);
        assert!(matches!(
            config.plans[2].policy(),
            SchedulePolicy::Until { period, .. } if period == Duration::from_millis(500)
        ));

        let warmup = config.plans[1].build(|| Ok(())).unwrap();
        assert_eq!(warmup.name(), "warmup");
        assert_eq!(warmup.next_run_offset(), Duration::from_millis(50));
    }

    #[test]
    fn zero_period_plans_fail_to_build() {
        let config = CadenceConfig::from_toml(
            r#"
            [[plans]]
            name = "broken"
            period_ms = 0
            "#,
        )
        .unwrap();
        assert!(config.plans[0].build(|| Ok(())).is_err());
    }

    #[test]
    fn environment_overrides_timer_settings() {
        std::env::set_var("CADENCE__TIMER__THREAD_PREFIX", "from-env");
        let config = CadenceConfig::load("/nonexistent/cadence.toml");
        std::env::remove_var("CADENCE__TIMER__THREAD_PREFIX");

        let config = config.unwrap();
        assert_eq!(config.timer.thread_prefix, "from-env");
        assert_eq!(config.timer.event_capacity, 64);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = CadenceConfig::load("/nonexistent/cadence.toml").unwrap();
        assert!(config.plans.is_empty());
    }
}
