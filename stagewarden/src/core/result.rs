//! Per-stage execution results.

use super::StepStatus;
use crate::clock::Timestamp;
use crate::stages::StageError;
use serde::{Deserialize, Serialize};

/// The outcome of executing one stage, across all of its attempts.
///
/// Created once per started stage and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Stage name.
    pub stage_name: String,
    /// Terminal status.
    pub status: StepStatus,
    /// Number of attempts made.
    pub attempts: u32,
    /// Wall time spent on the stage, backoff included.
    pub duration_ms: u64,
    /// Last error observed, preserved for non-successful results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    /// Whether a failure of this stage aborts the pipeline.
    pub critical: bool,
    /// When the first attempt began.
    pub started_at: Timestamp,
    /// When the stage reached its terminal status.
    pub ended_at: Timestamp,
    /// Value produced by the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl StepResult {
    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if this result should fail the pipeline.
    #[must_use]
    pub fn is_blocking_failure(&self) -> bool {
        self.critical && !self.is_success()
    }

    /// Short reason for a non-successful result.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        Some(
            self.error
                .as_ref()
                .map_or_else(|| self.status.to_string(), StageError::detail),
        )
    }
}
