//! Pipeline run report.

use super::{PipelineStatus, StepResult};
use crate::cancellation::CleanupFailure;
use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

/// The final, read-only record of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// Name of the pipeline.
    pub pipeline_name: String,
    /// Overall outcome.
    pub overall_status: PipelineStatus,
    /// One result per started stage, in declaration order.
    pub stage_results: Vec<StepResult>,
    /// When the run began.
    pub started_at: Timestamp,
    /// When cleanup finished.
    pub ended_at: Timestamp,
    /// Total run time including cleanup.
    pub duration_ms: u64,
    /// Number of cleanup actions invoked.
    pub cleanup_actions_run: usize,
    /// Non-fatal cleanup failures.
    #[serde(default)]
    pub cleanup_errors: Vec<CleanupFailure>,
    /// Run-level error, e.g. cancellation reason or a captured panic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineReport {
    /// Returns true if the run completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.overall_status.is_success()
    }

    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.overall_status.exit_code()
    }

    /// Results that did not succeed, critical or not.
    pub fn failed_stages(&self) -> impl Iterator<Item = &StepResult> {
        self.stage_results.iter().filter(|r| !r.is_success())
    }

    /// Looks up the result of a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StepResult> {
        self.stage_results.iter().find(|r| r.stage_name == name)
    }

    /// The line explaining why the run did not complete, if it did not.
    #[must_use]
    pub fn outcome_reason(&self) -> Option<String> {
        match self.overall_status {
            PipelineStatus::Completed => None,
            PipelineStatus::TimedOut => {
                Some("pipeline exceeded its overall time budget".to_string())
            }
            PipelineStatus::Cancelled => Some(format!(
                "pipeline was cancelled: {}",
                self.error.as_deref().unwrap_or("no reason given")
            )),
            PipelineStatus::Failed => {
                let blocking = self.stage_results.iter().find(|r| r.is_blocking_failure());
                match (blocking, &self.error) {
                    (Some(result), _) => Some(format!(
                        "stage {} failed after {} {}: {}",
                        result.stage_name,
                        result.attempts,
                        plural(result.attempts as usize, "attempt"),
                        result.failure_reason().unwrap_or_default()
                    )),
                    (None, Some(error)) => Some(format!("pipeline failed: {error}")),
                    (None, None) => Some("pipeline failed".to_string()),
                }
            }
        }
    }

    /// Human-readable multi-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "pipeline '{}' {} in {}ms (run {})",
            self.pipeline_name, self.overall_status, self.duration_ms, self.run_id
        );

        for result in &self.stage_results {
            let _ = write!(
                out,
                "  [{}] {} ({} {}, {}ms)",
                result.status,
                result.stage_name,
                result.attempts,
                plural(result.attempts as usize, "attempt"),
                result.duration_ms
            );
            if !result.critical {
                out.push_str(" non-critical");
            }
            if let Some(reason) = result.failure_reason() {
                let _ = write!(out, ": {reason}");
            }
            out.push('\n');
        }

        if let Some(reason) = self.outcome_reason() {
            let _ = writeln!(out, "{reason}");
        }

        if !self.cleanup_errors.is_empty() {
            let count = self.cleanup_errors.len();
            let _ = writeln!(
                out,
                "cleanup encountered {count} non-fatal {}",
                plural(count, "error")
            );
            for failure in &self.cleanup_errors {
                let _ = writeln!(out, "  {}: {}", failure.id, failure.message);
            }
        }

        out
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::now_utc;
    use crate::core::StepStatus;
    use crate::stages::StageError;
    use pretty_assertions::assert_eq;

    fn step(name: &str, status: StepStatus, attempts: u32, critical: bool) -> StepResult {
        let now = now_utc();
        StepResult {
            stage_name: name.to_string(),
            status,
            attempts,
            duration_ms: 10,
            error: (!status.is_success()).then(|| StageError::transient("net down")),
            critical,
            started_at: now,
            ended_at: now,
            output: None,
        }
    }

    fn report(status: PipelineStatus, stage_results: Vec<StepResult>) -> PipelineReport {
        let now = now_utc();
        PipelineReport {
            run_id: Uuid::nil(),
            pipeline_name: "demo".to_string(),
            overall_status: status,
            stage_results,
            started_at: now,
            ended_at: now,
            duration_ms: 30,
            cleanup_actions_run: 0,
            cleanup_errors: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn test_failed_reason_names_blocking_stage() {
        let report = report(
            PipelineStatus::Failed,
            vec![
                step("capture", StepStatus::Failed, 1, false),
                step("export", StepStatus::Failed, 3, true),
            ],
        );

        assert_eq!(
            report.outcome_reason(),
            Some("stage export failed after 3 attempts: net down".to_string())
        );
        assert_eq!(report.failed_stages().count(), 2);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_timed_out_reason() {
        let report = report(PipelineStatus::TimedOut, vec![]);
        assert_eq!(
            report.outcome_reason(),
            Some("pipeline exceeded its overall time budget".to_string())
        );
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn test_summary_mentions_cleanup_errors() {
        let mut report = report(
            PipelineStatus::Completed,
            vec![step("login", StepStatus::Success, 1, true)],
        );
        report.cleanup_actions_run = 2;
        report.cleanup_errors.push(CleanupFailure {
            id: "worker:browser".to_string(),
            message: "already exited".to_string(),
        });

        let summary = report.summary();
        assert!(summary.starts_with("pipeline 'demo' completed in 30ms"));
        assert!(summary.contains("  [success] login (1 attempt, 10ms)\n"));
        assert!(summary.contains("cleanup encountered 1 non-fatal error\n"));
        assert!(summary.contains("worker:browser: already exited"));
        assert!(report.is_success());
    }

    #[test]
    fn test_report_json_shape() {
        let report = report(PipelineStatus::Cancelled, vec![]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["overall_status"], "cancelled");
        assert_eq!(json["cleanup_errors"], serde_json::json!([]));
        assert!(json.get("error").is_none());

        let parsed: PipelineReport = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, report);
    }
}
