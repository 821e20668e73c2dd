//! Core domain model types for stagewarden.
//!
//! This module contains the values a run produces:
//! - Step, pipeline and state-machine status enums
//! - Per-stage results
//! - The final pipeline report

mod report;
mod result;
mod status;

pub use report::PipelineReport;
pub use result::StepResult;
pub use status::{PipelineState, PipelineStatus, StepStatus};
