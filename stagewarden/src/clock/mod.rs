//! Time sources for the supervisor.
//!
//! Every component reads time through this module: monotonic instants for
//! budgets and elapsed measurements, UTC timestamps for reports. Nothing else
//! in the crate touches the system clock directly.

mod deadline;

pub use deadline::Deadline;

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Wall-clock timestamp recorded in results and reports.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current monotonic instant.
#[must_use]
pub fn now() -> Instant {
    Instant::now()
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Measures elapsed time from a fixed starting instant.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    /// Starts a new stopwatch.
    #[must_use]
    pub fn start() -> Self {
        Self { start: now() }
    }

    /// Returns the elapsed time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        duration_ms(self.elapsed())
    }
}
