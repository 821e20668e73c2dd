//! Stage error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification driving retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// A hiccup worth retrying with backoff.
    Transient,
    /// A failure that will not go away; never retried.
    Permanent,
    /// A required resource (usually the worker) is unusable.
    ResourceUnavailable,
    /// The attempt ran out of time.
    Timeout,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::ResourceUnavailable => write!(f, "resource_unavailable"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Error returned by a stage function.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageError {
    /// Error classification.
    pub kind: StageErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Underlying cause, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl StageError {
    /// Creates a stage error of the given kind.
    #[must_use]
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Transient, message)
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Permanent, message)
    }

    /// Creates a resource-unavailable error.
    #[must_use]
    pub fn resource_unavailable(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::ResourceUnavailable, message)
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Timeout, message)
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Returns true for errors of the given kind.
    #[must_use]
    pub fn is(&self, kind: StageErrorKind) -> bool {
        self.kind == kind
    }

    /// Message including the cause, for reports.
    #[must_use]
    pub fn detail(&self) -> String {
        match &self.cause {
            Some(cause) => format!("{} ({cause})", self.message),
            None => self.message.clone(),
        }
    }
}
