//! Pipeline execution.
//!
//! This module provides:
//! - Supervisor configuration
//! - Retry policy and backoff
//! - The single-stage executor
//! - The pipeline supervisor

mod config;
mod executor;
mod retry;
mod supervisor;

pub use config::SupervisorConfig;
pub use executor::StepExecutor;
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use supervisor::{run_pipeline, CancelHandle, PipelineSupervisor};
