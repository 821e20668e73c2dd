//! # Stagewarden
//!
//! A supervisor for long-running, multi-stage jobs that depend on flaky
//! external workers (headless browsers, encoder daemons, remote APIs).
//!
//! Stagewarden runs an ordered list of stages under a global time budget and
//! provides:
//!
//! - **Per-stage deadlines**: every stage gets a child deadline capped by the
//!   remaining global budget
//! - **Classified retries**: transient and resource errors are retried with
//!   exponential backoff, permanent errors are not
//! - **Worker health**: a long-lived worker is started lazily, probed
//!   periodically and restarted when it stops answering
//! - **Guaranteed cleanup**: registered teardown actions run once, in reverse
//!   order, on success, failure, timeout, cancellation and panic
//! - **Structured reports**: every outcome ends up in a [`PipelineReport`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagewarden::prelude::*;
//! use std::time::Duration;
//!
//! let stages = vec![
//!     Stage::from_fn("login", |_ctx| async { Ok(serde_json::json!({"session": "s1"})) })
//!         .with_timeout(Duration::from_secs(30)),
//!     Stage::from_fn("capture", |_ctx| async { Err(StageError::transient("page not ready")) })
//!         .with_critical(false),
//! ];
//!
//! let report = run_pipeline(&stages, Duration::from_secs(120)).await;
//! println!("{}", report.summary());
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod clock;
pub mod core;
pub mod errors;
pub mod events;
pub mod health;
pub mod observability;
pub mod pipeline;
pub mod plan;
pub mod process;
pub mod stages;
pub mod testing;
pub mod worker;

pub use crate::core::PipelineReport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, CleanupManager, CleanupSummary};
    pub use crate::clock::Deadline;
    pub use crate::core::{PipelineReport, PipelineStatus, StepResult, StepStatus};
    pub use crate::errors::{SupervisorError, WorkerError};
    pub use crate::events::{
        CollectingReporter, LoggingReporter, NoOpReporter, ProgressEvent, ProgressReporter,
    };
    pub use crate::health::{HealthConfig, HealthMonitor, HealthSnapshot};
    pub use crate::pipeline::{
        run_pipeline, CancelHandle, PipelineSupervisor, RetryPolicy, SupervisorConfig,
    };
    pub use crate::plan::PipelinePlan;
    pub use crate::process::{CommandSpec, CommandStage, CommandWorker};
    pub use crate::stages::{Stage, StageContext, StageError, StageErrorKind, StageFn};
    pub use crate::worker::WorkerProcess;
}
