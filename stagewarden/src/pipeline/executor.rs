//! Single-stage execution with timeouts, retries and worker health gating.

use super::RetryPolicy;
use crate::cancellation::{CancellationToken, CleanupManager};
use crate::clock::{duration_ms, now_utc, Deadline, Stopwatch, Timestamp};
use crate::core::{StepResult, StepStatus};
use crate::errors::panic_message;
use crate::events::{ProgressEvent, ProgressReporter, SafeReporter};
use crate::stages::{Stage, StageContext, StageError, StageErrorKind};
use crate::worker::WorkerSlot;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs one stage to a terminal [`StepResult`].
///
/// Stage failures never escape as errors: every outcome, including panics
/// and timeouts, is folded into the returned result.
pub struct StepExecutor {
    retry: RetryPolicy,
    reporter: SafeReporter,
    cleanup: Arc<CleanupManager>,
    worker: Option<Arc<WorkerSlot>>,
}

impl StepExecutor {
    /// Creates an executor that registers worker teardown with `cleanup`.
    #[must_use]
    pub fn new(retry: RetryPolicy, cleanup: Arc<CleanupManager>) -> Self {
        Self {
            retry,
            reporter: SafeReporter::default(),
            cleanup,
            worker: None,
        }
    }

    /// Sets the progress reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = SafeReporter::new(reporter);
        self
    }

    /// Sets the worker used by stages that require one.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<WorkerSlot>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Executes `stage` within `deadline`.
    ///
    /// Attempts continue while the stage has attempts left, the retry policy
    /// allows it and the deadline has not expired.
    pub async fn execute(&self, stage: &Stage, deadline: &Deadline) -> StepResult {
        let started_at = now_utc();
        let timer = Stopwatch::start();
        let max_attempts = stage.effective_max_attempts();

        let mut attempts = 0;
        let mut last_error: Option<StageError> = None;
        let mut budget_exhausted = false;
        let mut retry_pending = false;

        while attempts < max_attempts && !deadline.expired() {
            attempts += 1;
            retry_pending = false;
            self.reporter.emit(&ProgressEvent::StageStarted {
                stage: stage.name().to_string(),
                attempt: attempts,
                elapsed_ms: timer.elapsed_ms(),
            });
            debug!(stage = %stage.name(), attempt = attempts, max_attempts, "Stage attempt started");

            let error = match self.run_attempt(stage, attempts, deadline).await {
                Ok(output) => {
                    self.reporter.emit(&ProgressEvent::StageSucceeded {
                        stage: stage.name().to_string(),
                        attempt: attempts,
                        elapsed_ms: timer.elapsed_ms(),
                    });
                    return self.finish(
                        stage,
                        StepStatus::Success,
                        attempts,
                        None,
                        Some(output),
                        started_at,
                        timer,
                    );
                }
                Err(error) => error,
            };

            let decision = if deadline.is_cancelled() {
                super::RetryDecision::give_up()
            } else {
                self.retry.decide(&error, attempts, max_attempts)
            };
            let mut will_retry = decision.should_retry;
            if will_retry && decision.delay >= deadline.remaining() {
                debug!(
                    stage = %stage.name(),
                    delay_ms = duration_ms(decision.delay),
                    remaining_ms = duration_ms(deadline.remaining()),
                    "Backoff exceeds remaining budget; giving up"
                );
                budget_exhausted = true;
                will_retry = false;
            }

            if error.is(StageErrorKind::Timeout) {
                self.reporter.emit(&ProgressEvent::StageTimedOut {
                    stage: stage.name().to_string(),
                    attempt: attempts,
                    elapsed_ms: timer.elapsed_ms(),
                });
            } else {
                self.reporter.emit(&ProgressEvent::StageAttemptFailed {
                    stage: stage.name().to_string(),
                    attempt: attempts,
                    elapsed_ms: timer.elapsed_ms(),
                    error: error.clone(),
                    will_retry,
                });
            }
            warn!(
                stage = %stage.name(),
                attempt = attempts,
                error = %error,
                will_retry,
                "Stage attempt failed"
            );

            let restart_worker = will_retry
                && stage.requires_worker()
                && error.is(StageErrorKind::ResourceUnavailable);
            last_error = Some(error);

            if !will_retry {
                break;
            }
            retry_pending = true;

            if restart_worker {
                self.restart_worker(deadline).await;
            }
            if !decision.delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(decision.delay) => {}
                    () = deadline.wait() => {}
                }
            }
        }

        let status = if deadline.is_cancelled() {
            StepStatus::Cancelled
        } else if budget_exhausted
            || last_error.is_none()
            || last_error.as_ref().is_some_and(|e| e.is(StageErrorKind::Timeout))
            || (retry_pending && deadline.expired())
        {
            StepStatus::TimedOut
        } else {
            StepStatus::Failed
        };

        if status == StepStatus::TimedOut && last_error.is_none() {
            last_error = Some(StageError::timeout(format!(
                "stage '{}' had no time budget left",
                stage.name()
            )));
        }

        self.finish(stage, status, attempts, last_error, None, started_at, timer)
    }

    async fn run_attempt(
        &self,
        stage: &Stage,
        attempt: u32,
        deadline: &Deadline,
    ) -> Result<Value, StageError> {
        let attempt_deadline = deadline.with_child(stage.timeout());

        if stage.requires_worker() {
            self.acquire_worker(stage, &attempt_deadline).await?;
        }

        let token = Arc::new(CancellationToken::new());
        let ctx = StageContext::new(stage.name(), attempt, Arc::clone(&token));
        let body = stage.body();
        let attempt_timer = Stopwatch::start();
        let mut task = tokio::spawn(async move { body.run(ctx).await });

        tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic().as_ref());
                    warn!(stage = %stage.name(), attempt, panic = %message, "Stage panicked");
                    Err(StageError::permanent(format!("stage '{}' panicked", stage.name()))
                        .with_cause(message))
                }
                Err(e) => Err(StageError::permanent(format!("stage '{}' task failed", stage.name()))
                    .with_cause(e)),
            },
            () = attempt_deadline.wait() => {
                let reason = match attempt_deadline.cancel_reason() {
                    Some(reason) => format!("run cancelled: {reason}"),
                    None => format!(
                        "stage '{}' timed out after {}ms",
                        stage.name(),
                        attempt_timer.elapsed_ms()
                    ),
                };
                // Cooperative: the task keeps running detached until it observes the token.
                token.cancel(reason.clone());
                Err(StageError::timeout(reason))
            }
        }
    }

    async fn acquire_worker(&self, stage: &Stage, deadline: &Deadline) -> Result<(), StageError> {
        let Some(slot) = &self.worker else {
            return Err(StageError::permanent(format!(
                "stage '{}' requires a worker but none is configured",
                stage.name()
            )));
        };

        let monitor = slot.ensure_started(&self.cleanup, deadline).await?;
        // Leave budget for a restart and another attempt.
        let health_deadline = deadline.with_child(slot.health_wait());
        monitor.wait_for_healthy(&health_deadline).await.map_err(|e| {
            StageError::resource_unavailable(format!("worker '{}' is not healthy", slot.name()))
                .with_cause(e)
        })
    }

    async fn restart_worker(&self, deadline: &Deadline) {
        let Some(slot) = &self.worker else {
            return;
        };
        if let Err(e) = slot.restart(&self.cleanup, deadline).await {
            warn!(worker = %slot.name(), error = %e, "Worker restart failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        stage: &Stage,
        status: StepStatus,
        attempts: u32,
        error: Option<StageError>,
        output: Option<Value>,
        started_at: Timestamp,
        timer: Stopwatch,
    ) -> StepResult {
        let result = StepResult {
            stage_name: stage.name().to_string(),
            status,
            attempts,
            duration_ms: timer.elapsed_ms(),
            error,
            critical: stage.is_critical(),
            started_at,
            ended_at: now_utc(),
            output,
        };

        info!(
            stage = %result.stage_name,
            status = %result.status,
            attempts = result.attempts,
            duration_ms = result.duration_ms,
            "Stage finished"
        );
        self.reporter.emit(&ProgressEvent::StageFinished {
            result: result.clone(),
        });
        result
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("retry", &self.retry)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Retry policy with tiny delays for fast tests.
#[cfg(test)]
pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy::new()
        .with_base_delay_ms(1)
        .with_max_delay_ms(4)
        .with_jitter_ratio(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingReporter;
    use crate::health::HealthConfig;
    use crate::testing::{ScriptStep, ScriptedStage, ScriptedWorker};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn executor(reporter: &Arc<CollectingReporter>) -> StepExecutor {
        StepExecutor::new(fast_retry(), Arc::new(CleanupManager::default()))
            .with_reporter(reporter.clone())
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::succeed(serde_json::json!({"ok": true}))]);
        let stage = script.stage("login");

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.output, Some(serde_json::json!({"ok": true})));
        assert!(result.error.is_none());
        assert_eq!(
            reporter.event_types(),
            vec!["stage.started", "stage.succeeded", "stage.finished"]
        );
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![
            ScriptStep::fail(StageError::transient("503")),
            ScriptStep::fail(StageError::transient("503")),
            ScriptStep::succeed(Value::Null),
        ]);
        let stage = script.stage("capture").with_max_attempts(3);

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.attempts, 3);
        assert_eq!(script.calls(), 3);
        assert_eq!(script.seen_attempts(), vec![1, 2, 3]);
        assert_eq!(
            reporter.event_types(),
            vec![
                "stage.started",
                "stage.attempt_failed",
                "stage.started",
                "stage.attempt_failed",
                "stage.started",
                "stage.succeeded",
                "stage.finished",
            ]
        );
    }

    #[tokio::test]
    async fn test_permanent_error_single_attempt() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::fail(StageError::permanent("bad config"))]);
        let stage = script.stage("export").with_max_attempts(5);

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error, Some(StageError::permanent("bad config")));
        match &reporter.events()[1] {
            ProgressEvent::StageAttemptFailed { will_retry, .. } => assert!(!will_retry),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_stage_single_attempt() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::fail(StageError::transient("flaky"))]);
        let stage = script.stage("narrate").with_retryable(false);

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_hanging_stage_times_out() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::Hang]);
        let stage = script.stage("capture").with_timeout(Duration::from_millis(50));
        let step_deadline = Deadline::after(Duration::from_secs(5)).with_child(stage.timeout());

        let start = std::time::Instant::now();
        let result = executor(&reporter).execute(&stage, &step_deadline).await;
        let elapsed = start.elapsed();

        assert_eq!(result.status, StepStatus::TimedOut);
        assert_eq!(result.attempts, 1);
        assert!(elapsed >= Duration::from_millis(45), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
        assert!(result.error.as_ref().is_some_and(|e| e.is(StageErrorKind::Timeout)));
        assert!(reporter.event_types().contains(&"stage.timed_out"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_cooperative_stage() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::HangUntilCancelled]);
        let stage = script.stage("capture").with_timeout(Duration::from_millis(20));

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::from_secs(5)).with_child(stage.timeout()))
            .await;
        assert_eq!(result.status, StepStatus::TimedOut);

        tokio::time::timeout(Duration::from_secs(1), script.wait_cancelled(1))
            .await
            .expect("stage should observe cancellation");
    }

    #[tokio::test]
    async fn test_attempt_timeout_retried_within_budget() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![
            ScriptStep::fail(StageError::timeout("upstream slow")),
            ScriptStep::succeed(Value::Null),
        ]);
        let stage = script.stage("narrate");

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_panicking_stage_is_permanent_failure() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::Panic("kaboom".to_string())]);
        let stage = script.stage("export");

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        let error = result.error.unwrap();
        assert_eq!(error.kind, StageErrorKind::Permanent);
        assert_eq!(error.cause.as_deref(), Some("kaboom"));
    }

    #[tokio::test]
    async fn test_backoff_longer_than_budget_fails_fast() {
        let reporter = Arc::new(CollectingReporter::new());
        let executor = StepExecutor::new(
            RetryPolicy::new()
                .with_base_delay_ms(10_000)
                .with_max_delay_ms(10_000)
                .with_jitter_ratio(0.0),
            Arc::new(CleanupManager::default()),
        )
        .with_reporter(reporter.clone());
        let script = ScriptedStage::new(vec![ScriptStep::fail(StageError::transient("503"))]);
        let stage = script.stage("capture");

        let start = std::time::Instant::now();
        let result = executor
            .execute(&stage, &Deadline::after(Duration::from_millis(200)))
            .await;

        assert!(start.elapsed() < Duration::from_millis(150));
        assert_eq!(result.status, StepStatus::TimedOut);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error, Some(StageError::transient("503")));
    }

    #[tokio::test]
    async fn test_cancelled_deadline_reports_cancelled() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::HangUntilCancelled]);
        let stage = script.stage("capture");
        let deadline = Deadline::after(Duration::from_secs(5));

        let token = Arc::clone(deadline.token());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel("operator abort");
        });

        let result = executor(&reporter).execute(&stage, &deadline).await;

        assert_eq!(result.status, StepStatus::Cancelled);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_runs_no_attempt() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::succeed(Value::Null)]);
        let stage = script.stage("late");

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::ZERO))
            .await;

        assert_eq!(result.status, StepStatus::TimedOut);
        assert_eq!(result.attempts, 0);
        assert_eq!(script.calls(), 0);
        assert_eq!(reporter.event_types(), vec!["stage.finished"]);
    }

    #[tokio::test]
    async fn test_worker_started_and_restarted_on_resource_unavailable() {
        let reporter = Arc::new(CollectingReporter::new());
        let cleanup = Arc::new(CleanupManager::default());
        let worker = Arc::new(ScriptedWorker::new("browser"));
        let slot = Arc::new(WorkerSlot::new(worker.clone()).with_health_config(HealthConfig {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            unhealthy_threshold: 3,
        }));
        let executor = StepExecutor::new(fast_retry(), Arc::clone(&cleanup))
            .with_reporter(reporter.clone())
            .with_worker(Arc::clone(&slot));

        let script = ScriptedStage::new(vec![
            ScriptStep::fail(StageError::resource_unavailable("browser crashed")),
            ScriptStep::succeed(Value::Null),
        ]);
        let stage = script.stage("capture").with_requires_worker(true);

        let result = executor
            .execute(&stage, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.attempts, 2);
        assert_eq!(slot.starts().await, 2);
        assert_eq!(cleanup.pending_ids(), vec!["worker:browser".to_string()]);

        let summary = cleanup.run_all().await;
        assert!(summary.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_worker_is_restarted_then_stage_runs() {
        let reporter = Arc::new(CollectingReporter::new());
        let cleanup = Arc::new(CleanupManager::default());
        let worker = Arc::new(ScriptedWorker::new("browser").healing_on_start());
        let slot = Arc::new(WorkerSlot::new(worker.clone()).with_health_config(HealthConfig {
            interval: Duration::from_millis(5),
            probe_timeout: Duration::from_millis(20),
            unhealthy_threshold: 1,
        }));
        let executor = StepExecutor::new(fast_retry(), Arc::clone(&cleanup))
            .with_reporter(reporter.clone())
            .with_worker(Arc::clone(&slot));

        let script = ScriptedStage::new(vec![ScriptStep::succeed(Value::Null)]);
        let stage = script
            .stage("capture")
            .with_requires_worker(true)
            .with_max_attempts(3)
            .with_timeout(Duration::from_millis(500));

        let deadline = Deadline::after(Duration::from_secs(5));
        let monitor = slot.ensure_started(&cleanup, &deadline).await.unwrap();
        worker.set_healthy(false);
        monitor.record_probe(Err("browser crashed".to_string()));

        let result = executor.execute(&stage, &deadline.with_child(stage.timeout())).await;

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.attempts, 2);
        assert_eq!(slot.starts().await, 2);
        assert_eq!(script.calls(), 1);
        assert!(!monitor.is_running());
        cleanup.run_all().await;
    }

    #[tokio::test]
    async fn test_hanging_worker_stop_does_not_outlive_deadline() {
        let reporter = Arc::new(CollectingReporter::new());
        let cleanup = Arc::new(CleanupManager::new(Duration::from_millis(50)));
        let worker = Arc::new(ScriptedWorker::new("browser").with_stop_delay(Duration::from_secs(3)));
        let slot = Arc::new(WorkerSlot::new(worker.clone()));
        let executor = StepExecutor::new(fast_retry(), Arc::clone(&cleanup))
            .with_reporter(reporter.clone())
            .with_worker(Arc::clone(&slot));

        let script = ScriptedStage::new(vec![
            ScriptStep::fail(StageError::resource_unavailable("browser crashed")),
            ScriptStep::succeed(Value::Null),
        ]);
        let stage = script.stage("capture").with_requires_worker(true);

        let started = std::time::Instant::now();
        let result = executor
            .execute(&stage, &Deadline::after(Duration::from_millis(200)))
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.status, StepStatus::TimedOut);
        assert!(worker.stop_calls() >= 1);
    }

    #[tokio::test]
    async fn test_missing_worker_is_permanent() {
        let reporter = Arc::new(CollectingReporter::new());
        let script = ScriptedStage::new(vec![ScriptStep::succeed(Value::Null)]);
        let stage = script.stage("capture").with_requires_worker(true);

        let result = executor(&reporter)
            .execute(&stage, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(script.calls(), 0);
    }
}
