//! Step, pipeline and state-machine status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome of executing one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The stage succeeded (possibly after retries).
    Success,
    /// The stage exhausted its attempts.
    Failed,
    /// The stage ran out of time budget.
    TimedOut,
    /// The run was cancelled while the stage was executing.
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StepStatus {
    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every critical stage succeeded.
    Completed,
    /// A critical stage did not succeed, or execution broke down.
    Failed,
    /// The global deadline expired.
    TimedOut,
    /// An external caller cancelled the run.
    Cancelled,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl PipelineStatus {
    /// Returns true if the run completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Process exit code for command-line wrappers.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed => 1,
            Self::TimedOut => 2,
            Self::Cancelled => 130,
        }
    }
}

/// Pipeline-level state machine.
///
/// `Initializing -> Executing -> {Completed | Failed | TimedOut | Cancelled}
/// -> CleaningUp -> Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Supervisor constructed, run not started.
    Initializing,
    /// Stages are being executed.
    Executing,
    /// Execution finished and every critical stage succeeded.
    Completed,
    /// Execution aborted on a critical failure.
    Failed,
    /// Execution aborted on global deadline expiry.
    TimedOut,
    /// Execution aborted on external cancellation.
    Cancelled,
    /// Cleanup actions are running.
    CleaningUp,
    /// The report has been assembled.
    Done,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Initializing
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Executing => write!(f, "executing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::CleaningUp => write!(f, "cleaning_up"),
            Self::Done => write!(f, "done"),
        }
    }
}

impl PipelineState {
    /// Returns true if `next` is a legal successor of this state.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Initializing => matches!(next, Self::Executing),
            Self::Executing => matches!(
                next,
                Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
            ),
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled => {
                matches!(next, Self::CleaningUp)
            }
            Self::CleaningUp => matches!(next, Self::Done),
            Self::Done => false,
        }
    }

    /// Returns true if this is the final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl From<PipelineStatus> for PipelineState {
    fn from(status: PipelineStatus) -> Self {
        match status {
            PipelineStatus::Completed => Self::Completed,
            PipelineStatus::Failed => Self::Failed,
            PipelineStatus::TimedOut => Self::TimedOut,
            PipelineStatus::Cancelled => Self::Cancelled,
        }
    }
}
