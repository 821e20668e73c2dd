//! Testing utilities for stagewarden pipelines.
//!
//! This module provides:
//! - Scripted stage bodies, workers and probes
//! - Assertions over pipeline reports and progress events

mod assertions;
mod mocks;

pub use assertions::{
    assert_clean_cleanup, assert_pipeline_status, assert_stage_events, assert_step_status,
};
pub use mocks::{ScriptStep, ScriptedProbe, ScriptedStage, ScriptedWorker};
