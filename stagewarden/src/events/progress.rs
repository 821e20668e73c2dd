//! Progress events emitted during a run.

use crate::core::{PipelineReport, StepResult};
use crate::stages::StageError;
use serde::{Deserialize, Serialize};

/// A state transition observed by the supervisor.
///
/// Elapsed times are measured from the start of the stage for stage events
/// and from the start of the run for cleanup events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// An attempt is about to run.
    StageStarted {
        /// Stage name.
        stage: String,
        /// 1-based attempt number.
        attempt: u32,
        /// Time since the stage began.
        elapsed_ms: u64,
    },
    /// An attempt failed.
    StageAttemptFailed {
        /// Stage name.
        stage: String,
        /// 1-based attempt number.
        attempt: u32,
        /// Time since the stage began.
        elapsed_ms: u64,
        /// The failure.
        error: StageError,
        /// Whether another attempt follows.
        will_retry: bool,
    },
    /// An attempt succeeded.
    StageSucceeded {
        /// Stage name.
        stage: String,
        /// 1-based attempt number.
        attempt: u32,
        /// Time since the stage began.
        elapsed_ms: u64,
    },
    /// An attempt ran out of time.
    StageTimedOut {
        /// Stage name.
        stage: String,
        /// 1-based attempt number.
        attempt: u32,
        /// Time since the stage began.
        elapsed_ms: u64,
    },
    /// The stage reached its terminal status.
    StageFinished {
        /// The stage result.
        result: StepResult,
    },
    /// The cleanup phase is starting.
    CleanupStarted {
        /// Actions waiting to run.
        pending: usize,
        /// Time since the run began.
        elapsed_ms: u64,
    },
    /// The cleanup phase finished.
    CleanupFinished {
        /// Actions invoked.
        executed: usize,
        /// Actions that failed.
        errors: usize,
        /// Time since the run began.
        elapsed_ms: u64,
    },
    /// The run is over.
    PipelineFinished {
        /// The final report.
        report: Box<PipelineReport>,
    },
}

impl ProgressEvent {
    /// Dotted event type, e.g. `stage.started`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stage.started",
            Self::StageAttemptFailed { .. } => "stage.attempt_failed",
            Self::StageSucceeded { .. } => "stage.succeeded",
            Self::StageTimedOut { .. } => "stage.timed_out",
            Self::StageFinished { .. } => "stage.finished",
            Self::CleanupStarted { .. } => "cleanup.started",
            Self::CleanupFinished { .. } => "cleanup.finished",
            Self::PipelineFinished { .. } => "pipeline.finished",
        }
    }

    /// The stage the event belongs to, if any.
    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::StageStarted { stage, .. }
            | Self::StageAttemptFailed { stage, .. }
            | Self::StageSucceeded { stage, .. }
            | Self::StageTimedOut { stage, .. } => Some(stage),
            Self::StageFinished { result } => Some(&result.stage_name),
            Self::CleanupStarted { .. }
            | Self::CleanupFinished { .. }
            | Self::PipelineFinished { .. } => None,
        }
    }

    /// The attempt number, for per-attempt events.
    #[must_use]
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Self::StageStarted { attempt, .. }
            | Self::StageAttemptFailed { attempt, .. }
            | Self::StageSucceeded { attempt, .. }
            | Self::StageTimedOut { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }
}
