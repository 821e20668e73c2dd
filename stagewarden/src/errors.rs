//! Error types for the stagewarden supervisor.
//!
//! Stage-level failures are values (`StageError`, see [`crate::stages`]) and
//! never travel through this module. The types here cover the surrounding
//! machinery: configuration, worker processes, the cleanup registry and the
//! pipeline state machine.

use crate::core::PipelineState;
use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// The main error type for supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supplied configuration or plan is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A cleanup action was registered after the cleanup phase ran.
    #[error("Cleanup already ran; refusing to register '{id}'")]
    CleanupClosed {
        /// Id of the rejected action.
        id: String,
    },

    /// The pipeline state machine was asked to make an illegal move.
    #[error("Invalid pipeline state transition: {from} -> {to}")]
    InvalidTransition {
        /// State before the transition.
        from: PipelineState,
        /// Requested state.
        to: PipelineState,
    },

    /// A worker process error.
    #[error("{0}")]
    Worker(#[from] WorkerError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Errors raised by long-lived worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The worker could not be started.
    #[error("Worker '{name}' failed to start: {reason}")]
    Start {
        /// Worker name.
        name: String,
        /// Why the start failed.
        reason: String,
    },

    /// A liveness probe failed.
    #[error("Probe of worker '{name}' failed: {reason}")]
    Probe {
        /// Worker name.
        name: String,
        /// Why the probe failed.
        reason: String,
    },

    /// A liveness probe did not answer in time.
    #[error("Probe timed out after {}ms", timeout.as_millis())]
    ProbeTimeout {
        /// The probe timeout that elapsed.
        timeout: Duration,
    },

    /// The worker could not be stopped cleanly.
    #[error("Worker '{name}' failed to stop: {reason}")]
    Stop {
        /// Worker name.
        name: String,
        /// Why the stop failed.
        reason: String,
    },

    /// The worker is not running.
    #[error("Worker '{name}' is not running")]
    NotRunning {
        /// Worker name.
        name: String,
    },
}

impl WorkerError {
    /// Creates a start error.
    #[must_use]
    pub fn start(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Start {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a probe error.
    #[must_use]
    pub fn probe(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Probe {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a stop error.
    #[must_use]
    pub fn stop(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Stop {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a not-running error.
    #[must_use]
    pub fn not_running(name: impl Into<String>) -> Self {
        Self::NotRunning { name: name.into() }
    }
}

/// Reasons a wait for a healthy worker can end without one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthWaitError {
    /// The deadline expired (or the run was cancelled) first.
    #[error("Worker did not become healthy before the deadline{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Timeout {
        /// Last recorded unhealthy reason.
        reason: Option<String>,
    },

    /// The monitor was stopped while waiting.
    #[error("Health monitor stopped")]
    Stopped,
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
