//! Time helpers: the `TimeMeasurer` stopwatch and wall-clock conversions.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};

/// A stopwatch used to report how long a piece of work took.
///
/// The measurer accumulates time across several start/stop spans until it is
/// reset.
#[derive(Debug, Clone, Default)]
pub struct TimeMeasurer {
    started_at: Option<Instant>,
    accumulated: Duration,
}

impl TimeMeasurer {
    /// Creates a stopped measurer with nothing accumulated.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a measurer that is already running.
    pub fn started() -> Self {
        let mut measurer = Self::new();
        measurer.start();
        measurer
    }

    /// Starts a new span. Does nothing if a span is already running.
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    /// Closes the running span and returns the total elapsed time.
    pub fn stop(&mut self) -> Duration {
        if let Some(started_at) = self.started_at.take() {
            self.accumulated += started_at.elapsed();
        }
        self.accumulated
    }

    /// Clears the accumulated time and stops the measurer.
    pub fn reset(&mut self) {
        self.started_at = None;
        self.accumulated = Duration::ZERO;
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Total elapsed time, including the running span if there is one.
    pub fn elapsed(&self) -> Duration {
        match self.started_at {
            Some(started_at) => self.accumulated + started_at.elapsed(),
            None => self.accumulated,
        }
    }

    /// Times a closure and returns its output along with the duration.
    pub fn measure<T>(work: impl FnOnce() -> T) -> (T, Duration) {
        let mut measurer = Self::started();
        let output = work();
        (output, measurer.stop())
    }
}

impl fmt::Display for TimeMeasurer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.elapsed();
        if elapsed >= Duration::from_secs(1) {
            write!(f, "{:.3}s", elapsed.as_secs_f64())
        } else if elapsed >= Duration::from_millis(1) {
            write!(f, "{}ms", elapsed.as_millis())
        } else {
            write!(f, "{}µs", elapsed.as_micros())
        }
    }
}

/// The wall-clock source for run timestamps.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Adds a std `Duration` to a timestamp, saturating at the far future.
pub fn add(at: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(offset)
        .ok()
        .and_then(|offset| at.checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How long from now until `at`. Zero if `at` has already passed.
pub fn until(at: DateTime<Utc>) -> Duration {
    (at - now()).to_std().unwrap_or(Duration::ZERO)
}
