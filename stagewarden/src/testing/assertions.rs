//! Test assertions for reports and progress events.

use crate::core::{PipelineReport, PipelineStatus, StepStatus};
use crate::events::CollectingReporter;

/// Asserts the overall status of a run.
pub fn assert_pipeline_status(report: &PipelineReport, expected: PipelineStatus) {
    assert_eq!(
        report.overall_status,
        expected,
        "Expected pipeline status {expected:?}, got {:?}\n{}",
        report.overall_status,
        report.summary()
    );
}

/// Asserts the status of one stage.
pub fn assert_step_status(report: &PipelineReport, stage: &str, expected: StepStatus) {
    let result = report.stage(stage).unwrap_or_else(|| {
        panic!(
            "Expected a result for stage '{stage}'. Stages: {:?}",
            report
                .stage_results
                .iter()
                .map(|r| r.stage_name.as_str())
                .collect::<Vec<_>>()
        )
    });
    assert_eq!(
        result.status, expected,
        "Expected stage '{stage}' to be {expected:?}, got {:?}",
        result.status
    );
}

/// Asserts cleanup ran `executed` actions without errors.
pub fn assert_clean_cleanup(report: &PipelineReport, executed: usize) {
    assert_eq!(
        report.cleanup_actions_run, executed,
        "Expected {executed} cleanup actions, got {}",
        report.cleanup_actions_run
    );
    assert!(
        report.cleanup_errors.is_empty(),
        "Expected no cleanup errors, got {:?}",
        report.cleanup_errors
    );
}

/// Asserts the event types a stage emitted, in order.
pub fn assert_stage_events(reporter: &CollectingReporter, stage: &str, expected: &[&str]) {
    let actual: Vec<&str> = reporter
        .events_for_stage(stage)
        .iter()
        .map(crate::events::ProgressEvent::event_type)
        .collect();
    assert_eq!(
        actual, expected,
        "Unexpected event sequence for stage '{stage}'"
    );
}
