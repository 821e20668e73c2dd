//! Plan files loaded from disk and run end to end.

use stagewarden::core::{PipelineStatus, StepStatus};
use stagewarden::errors::SupervisorError;
use stagewarden::pipeline::PipelineSupervisor;
use stagewarden::plan::PipelinePlan;
use stagewarden::testing::{assert_pipeline_status, assert_step_status};
use std::io::Write;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};

fn write_plan(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn test_missing_plan_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = PipelinePlan::from_path(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, SupervisorError::Io(_)));
}

#[test]
fn test_invalid_plan_file_is_rejected() {
    let file = write_plan(r#"{"name": "empty", "stages": []}"#);
    let err = PipelinePlan::from_path(file.path()).unwrap_err();
    assert!(matches!(err, SupervisorError::Config(_)));
}

#[cfg(unix)]
mod unix {
    use super::*;

    const PLAN: &str = r#"{
        "name": "nightly",
        "timeout_ms": 10000,
        "supervisor": { "retry": { "base_delay_ms": 1, "max_delay_ms": 2, "jitter_ratio": 0.0 } },
        "stages": [
            { "name": "fetch", "command": { "program": "sh", "args": ["-c", "echo fetched"] } },
            { "name": "thumbs", "critical": false, "max_attempts": 2,
              "command": { "program": "sh", "args": ["-c", "exit 75"] },
              "transient_exit_codes": [75] },
            { "name": "publish", "command": { "program": "sh", "args": ["-c", "exit 0"] } }
        ]
    }"#;

    #[tokio::test]
    async fn test_plan_runs_to_completion() {
        let file = write_plan(PLAN);
        let plan = PipelinePlan::from_path(file.path()).unwrap();

        let report = PipelineSupervisor::new(plan.supervisor_config())
            .run(&plan.stages(), plan.timeout())
            .await;

        assert_pipeline_status(&report, PipelineStatus::Completed);
        assert_eq!(report.pipeline_name, "nightly");
        assert_step_status(&report, "fetch", StepStatus::Success);
        assert_step_status(&report, "thumbs", StepStatus::Failed);
        assert_step_status(&report, "publish", StepStatus::Success);

        let fetch = report.stage("fetch").unwrap();
        assert_eq!(fetch.output.as_ref().unwrap()["stdout"], "fetched\n");
        assert_eq!(report.stage("thumbs").unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_critical_command_failure_fails_run() {
        let file = write_plan(
            r#"{"name": "broken", "stages": [
                { "name": "a", "command": { "program": "sh", "args": ["-c", "exit 2"] } },
                { "name": "b", "command": { "program": "true" } }
            ]}"#,
        );
        let plan = PipelinePlan::from_path(file.path()).unwrap();
        let report = PipelineSupervisor::new(plan.supervisor_config())
            .run(&plan.stages(), plan.timeout())
            .await;

        assert_pipeline_status(&report, PipelineStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.stage("a").unwrap().attempts, 1);
        assert!(report.stage("b").is_none());
    }

    fn stagewarden(args: &[&str]) -> std::process::Output {
        std::process::Command::new(env!("CARGO_BIN_EXE_stagewarden"))
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn path_str(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    #[test]
    fn test_cli_validate_and_run() {
        let file = write_plan(PLAN);
        let dir = TempDir::new().unwrap();
        let report_path = dir.path().join("report.json");

        let validate = stagewarden(&["validate", path_str(file.path())]);
        assert!(validate.status.success());
        assert!(String::from_utf8_lossy(&validate.stdout).contains("Plan 'nightly' is valid"));

        let run = stagewarden(&[
            "run",
            path_str(file.path()),
            "--report",
            path_str(&report_path),
        ]);
        assert_eq!(run.status.code(), Some(0));

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(saved["overall_status"], "completed");
        assert_eq!(saved["stage_results"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_cli_logs_each_stage_once() {
        let file = write_plan(PLAN);
        let run = stagewarden(&["run", path_str(file.path())]);
        assert_eq!(run.status.code(), Some(0));

        let logs = String::from_utf8_lossy(&run.stderr);
        assert_eq!(logs.matches("Stage finished").count(), 3, "{logs}");
    }

    #[test]
    fn test_cli_timeout_exit_code() {
        let file = write_plan(
            r#"{"name": "slow", "stages": [
                { "name": "sleep", "command": { "program": "sh", "args": ["-c", "sleep 30"] } }
            ]}"#,
        );
        let run = stagewarden(&["run", path_str(file.path()), "--timeout-secs", "1"]);
        assert_eq!(run.status.code(), Some(2));
    }
}
