//! Supervisor configuration.

use super::RetryPolicy;
use crate::errors::SupervisorError;
use crate::health::HealthConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by every run of a supervisor.
///
/// Durations are stored in milliseconds so the struct reads naturally from
/// JSON plan files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Name reported for the pipeline.
    pub pipeline_name: String,
    /// Budget for each individual cleanup action.
    pub cleanup_timeout_ms: u64,
    /// Interval between worker liveness probes.
    pub health_interval_ms: u64,
    /// Budget for a single liveness probe.
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes before the worker is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// Budget for starting the worker.
    pub worker_start_timeout_ms: u64,
    /// Retry policy applied to every stage.
    pub retry: RetryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pipeline_name: "pipeline".to_string(),
            cleanup_timeout_ms: 10_000,
            health_interval_ms: 1_000,
            probe_timeout_ms: 2_000,
            unhealthy_threshold: 3,
            worker_start_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    /// Creates a config with defaults and the given pipeline name.
    #[must_use]
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            ..Self::default()
        }
    }

    /// Sets the pipeline name.
    #[must_use]
    pub fn with_pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = name.into();
        self
    }

    /// Sets the per-action cleanup timeout.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout_ms = crate::clock::duration_ms(timeout);
        self
    }

    /// Sets the health probe interval.
    #[must_use]
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval_ms = crate::clock::duration_ms(interval);
        self
    }

    /// Sets the probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = crate::clock::duration_ms(timeout);
        self
    }

    /// Sets the unhealthy threshold.
    #[must_use]
    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    /// Sets the worker start timeout.
    #[must_use]
    pub fn with_worker_start_timeout(mut self, timeout: Duration) -> Self {
        self.worker_start_timeout_ms = crate::clock::duration_ms(timeout);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-action cleanup timeout.
    #[must_use]
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    /// Worker start timeout.
    #[must_use]
    pub fn worker_start_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_start_timeout_ms)
    }

    /// Health monitor settings derived from this config.
    #[must_use]
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(self.health_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            unhealthy_threshold: self.unhealthy_threshold.max(1),
        }
    }

    /// Checks the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.pipeline_name.trim().is_empty() {
            return Err(SupervisorError::config("pipeline_name must not be empty"));
        }
        let positive = [
            ("cleanup_timeout_ms", self.cleanup_timeout_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("worker_start_timeout_ms", self.worker_start_timeout_ms),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(SupervisorError::config(format!("{field} must be positive")));
        }
        if self.unhealthy_threshold == 0 {
            return Err(SupervisorError::config("unhealthy_threshold must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(SupervisorError::config(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms",
            ));
        }
        Ok(())
    }
}
