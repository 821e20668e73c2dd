//! Stage definitions and the context handed to stage functions.
//!
//! A stage is a named unit of work with its own timeout and retry budget.
//! The supervisor only references stages; they are immutable once a run
//! starts.

mod error;

pub use error::{StageError, StageErrorKind};

use crate::cancellation::CancellationToken;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default per-stage timeout.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Context passed to a single stage attempt.
///
/// Exposes cooperative cancellation and the attempt's identity, nothing else.
#[derive(Debug, Clone)]
pub struct StageContext {
    stage_name: Arc<str>,
    attempt: u32,
    token: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a new stage context.
    #[must_use]
    pub fn new(stage_name: impl Into<Arc<str>>, attempt: u32, token: Arc<CancellationToken>) -> Self {
        Self {
            stage_name: stage_name.into(),
            attempt,
            token,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns true once the attempt has been asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns why the attempt was asked to stop.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.token.reason()
    }

    /// Resolves once the attempt has been asked to stop.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// The body of a stage.
#[async_trait]
pub trait StageFn: Send + Sync {
    /// Runs one attempt of the stage.
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError>;
}

/// An async closure-based stage body.
pub struct FnStage<F> {
    func: F,
}

impl<F, Fut> FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StageError>> + Send,
{
    /// Wraps an async closure.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> StageFn for FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StageError>> + Send,
{
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        (self.func)(ctx).await
    }
}

/// A named unit of pipeline work.
#[derive(Clone)]
pub struct Stage {
    name: String,
    body: Arc<dyn StageFn>,
    timeout: Duration,
    retryable: bool,
    max_attempts: u32,
    critical: bool,
    requires_worker: bool,
}

impl Stage {
    /// Creates a critical, retryable stage with default budgets.
    pub fn new(name: impl Into<String>, body: impl StageFn + 'static) -> Self {
        Self::from_shared(name, Arc::new(body))
    }

    /// Creates a stage around a body shared with the caller.
    pub fn from_shared(name: impl Into<String>, body: Arc<dyn StageFn>) -> Self {
        Self {
            name: name.into(),
            body,
            timeout: DEFAULT_STAGE_TIMEOUT,
            retryable: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            critical: true,
            requires_worker: false,
        }
    }

    /// Creates a stage from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StageError>> + Send + 'static,
    {
        Self::new(name, FnStage::new(func))
    }

    /// Sets the per-stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of attempts (at least 1).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets whether failed attempts may be retried.
    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Sets whether a failure of this stage aborts the pipeline.
    #[must_use]
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Declares that the stage needs the shared worker process.
    #[must_use]
    pub fn with_requires_worker(mut self, requires_worker: bool) -> Self {
        self.requires_worker = requires_worker;
        self
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the per-stage timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns true if failed attempts may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Returns the configured maximum attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempts actually allowed: one when the stage is not retryable.
    #[must_use]
    pub fn effective_max_attempts(&self) -> u32 {
        if self.retryable {
            self.max_attempts
        } else {
            1
        }
    }

    /// Returns true if a failure aborts the pipeline.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Returns true if the stage needs the shared worker.
    #[must_use]
    pub fn requires_worker(&self) -> bool {
        self.requires_worker
    }

    pub(crate) fn body(&self) -> Arc<dyn StageFn> {
        Arc::clone(&self.body)
    }
}

impl Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retryable", &self.retryable)
            .field("max_attempts", &self.max_attempts)
            .field("critical", &self.critical)
            .field("requires_worker", &self.requires_worker)
            .finish_non_exhaustive()
    }
}
