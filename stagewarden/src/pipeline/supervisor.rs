//! Pipeline supervisor: sequential stage execution under a global deadline
//! with guaranteed cleanup.

use super::{StepExecutor, SupervisorConfig};
use crate::cancellation::{CancellationToken, CleanupManager};
use crate::clock::{duration_ms, now_utc, Deadline, Stopwatch};
use crate::core::{PipelineReport, PipelineState, PipelineStatus, StepResult, StepStatus};
use crate::errors::{panic_message, SupervisorError};
use crate::events::{ProgressEvent, ProgressReporter, SafeReporter};
use crate::stages::Stage;
use crate::worker::{WorkerProcess, WorkerSlot};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handle for cancelling a run from outside, e.g. a signal handler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: Arc<CancellationToken>,
}

impl CancelHandle {
    /// Forces the run's root deadline to expire immediately.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.token.cancel(reason);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs a list of stages once, start to finish.
///
/// A supervisor is consumed by [`run`](Self::run): the cleanup registry and
/// the state machine belong to exactly one run.
pub struct PipelineSupervisor {
    config: SupervisorConfig,
    run_id: Uuid,
    reporter: SafeReporter,
    worker: Option<Arc<WorkerSlot>>,
    cleanup: Arc<CleanupManager>,
    cancel: Arc<CancellationToken>,
    state: Mutex<PipelineState>,
}

impl PipelineSupervisor {
    /// Creates a supervisor.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        let cleanup = Arc::new(CleanupManager::new(config.cleanup_timeout()));
        Self {
            config,
            run_id: Uuid::new_v4(),
            reporter: SafeReporter::default(),
            worker: None,
            cleanup,
            cancel: Arc::new(CancellationToken::new()),
            state: Mutex::new(PipelineState::Initializing),
        }
    }

    /// Sets the progress reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = SafeReporter::new(reporter);
        self
    }

    /// Attaches the worker shared by stages that require one.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn WorkerProcess>) -> Self {
        self.worker = Some(Arc::new(WorkerSlot::from_config(worker, &self.config)));
        self
    }

    /// Attaches a preconfigured worker slot.
    #[must_use]
    pub fn with_worker_slot(mut self, slot: Arc<WorkerSlot>) -> Self {
        self.worker = Some(slot);
        self
    }

    /// Id of the run this supervisor will perform.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the supervisor's configuration.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Returns a handle that cancels the run.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: Arc::clone(&self.cancel),
        }
    }

    /// Cleanup registry of this run; callers may register their own resources.
    #[must_use]
    pub fn cleanup_manager(&self) -> Arc<CleanupManager> {
        Arc::clone(&self.cleanup)
    }

    /// Current state of the run.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    fn enter(&self, next: PipelineState) -> Result<(), SupervisorError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(SupervisorError::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        debug!(run_id = %self.run_id, from = %*state, to = %next, "Pipeline state transition");
        *state = next;
        Ok(())
    }

    fn advance(&self, next: PipelineState) {
        if let Err(e) = self.enter(next) {
            error!(run_id = %self.run_id, error = %e, "Rejected pipeline state transition");
        }
    }

    /// Runs `stages` in order within `global_timeout`.
    ///
    /// Always runs the cleanup phase, whatever the outcome, and always
    /// returns a report.
    pub async fn run(self, stages: &[Stage], global_timeout: Duration) -> PipelineReport {
        let started_at = now_utc();
        let timer = Stopwatch::start();
        let root = Deadline::with_token(global_timeout, Arc::clone(&self.cancel));

        info!(
            run_id = %self.run_id,
            pipeline = %self.config.pipeline_name,
            stages = stages.len(),
            timeout_ms = duration_ms(global_timeout),
            "Pipeline started"
        );
        self.advance(PipelineState::Executing);

        let mut executor =
            StepExecutor::new(self.config.retry.clone(), Arc::clone(&self.cleanup))
                .with_reporter(Arc::new(self.reporter.clone()));
        if let Some(slot) = &self.worker {
            executor = executor.with_worker(Arc::clone(slot));
        }

        let mut results: Vec<StepResult> = Vec::with_capacity(stages.len());
        let outcome = AssertUnwindSafe(self.execute_stages(&executor, stages, &root, &mut results))
            .catch_unwind()
            .await;

        let (status, run_error) = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(run_id = %self.run_id, panic = %message, "Pipeline execution panicked");
                (
                    PipelineStatus::Failed,
                    Some(format!("execution panicked: {message}")),
                )
            }
        };
        self.advance(status.into());

        self.advance(PipelineState::CleaningUp);
        self.reporter.emit(&ProgressEvent::CleanupStarted {
            pending: self.cleanup.pending_count(),
            elapsed_ms: timer.elapsed_ms(),
        });
        let cleanup = self.cleanup.run_all().await;
        self.reporter.emit(&ProgressEvent::CleanupFinished {
            executed: cleanup.executed,
            errors: cleanup.errors.len(),
            elapsed_ms: timer.elapsed_ms(),
        });
        if !cleanup.errors.is_empty() {
            warn!(
                run_id = %self.run_id,
                errors = cleanup.errors.len(),
                "Cleanup encountered non-fatal errors"
            );
        }

        let report = PipelineReport {
            run_id: self.run_id,
            pipeline_name: self.config.pipeline_name.clone(),
            overall_status: status,
            stage_results: results,
            started_at,
            ended_at: now_utc(),
            duration_ms: timer.elapsed_ms(),
            cleanup_actions_run: cleanup.executed,
            cleanup_errors: cleanup.errors,
            error: run_error,
        };

        self.advance(PipelineState::Done);
        info!(
            run_id = %self.run_id,
            status = %report.overall_status,
            duration_ms = report.duration_ms,
            "Pipeline finished"
        );
        self.reporter.emit(&ProgressEvent::PipelineFinished {
            report: Box::new(report.clone()),
        });
        report
    }

    async fn execute_stages(
        &self,
        executor: &StepExecutor,
        stages: &[Stage],
        root: &Deadline,
        results: &mut Vec<StepResult>,
    ) -> (PipelineStatus, Option<String>) {
        for stage in stages {
            if root.is_cancelled() {
                return self.cancelled(root);
            }
            if root.expired() {
                info!(run_id = %self.run_id, next_stage = %stage.name(), "Global deadline expired");
                return (PipelineStatus::TimedOut, None);
            }

            let result = executor
                .execute(stage, &root.with_child(stage.timeout()))
                .await;
            let status = result.status;
            let blocking = result.is_blocking_failure();
            results.push(result);

            if status == StepStatus::Cancelled || root.is_cancelled() {
                return self.cancelled(root);
            }
            if status != StepStatus::Success && root.expired() {
                return (PipelineStatus::TimedOut, None);
            }
            if blocking {
                info!(run_id = %self.run_id, stage = %stage.name(), "Critical stage failed; aborting");
                return (PipelineStatus::Failed, None);
            }
            if status != StepStatus::Success {
                warn!(stage = %stage.name(), status = %status, "Non-critical stage failed; continuing");
            }
        }

        (PipelineStatus::Completed, None)
    }

    fn cancelled(&self, root: &Deadline) -> (PipelineStatus, Option<String>) {
        let reason = root
            .cancel_reason()
            .unwrap_or_else(|| "cancelled".to_string());
        info!(run_id = %self.run_id, reason = %reason, "Pipeline cancelled");
        (PipelineStatus::Cancelled, Some(reason))
    }
}

impl std::fmt::Debug for PipelineSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSupervisor")
            .field("run_id", &self.run_id)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Runs `stages` with a default supervisor.
pub async fn run_pipeline(stages: &[Stage], global_timeout: Duration) -> PipelineReport {
    PipelineSupervisor::new(SupervisorConfig::default())
        .run(stages, global_timeout)
        .await
}
