//! JSON pipeline plans.
//!
//! A plan describes a pipeline of external commands and the optional worker
//! they share. It is the input format of the `stagewarden` binary.
//!
//! ```json
//! {
//!   "name": "nightly-capture",
//!   "timeout_ms": 600000,
//!   "worker": { "name": "browser", "command": { "program": "chromium", "args": ["--headless"] } },
//!   "stages": [
//!     { "name": "login", "command": { "program": "./login.sh" }, "requires_worker": true },
//!     { "name": "capture", "command": { "program": "./capture.sh" }, "critical": false }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::SupervisorError;
use crate::pipeline::SupervisorConfig;
use crate::process::{CommandSpec, CommandStage, CommandWorker, DEFAULT_STOP_TIMEOUT};
use crate::stages::{Stage, DEFAULT_MAX_ATTEMPTS, DEFAULT_STAGE_TIMEOUT};
use crate::worker::WorkerProcess;

const fn default_timeout_ms() -> u64 {
    600_000
}

const fn default_stage_timeout_ms() -> u64 {
    DEFAULT_STAGE_TIMEOUT.as_secs() * 1000
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_stop_timeout_ms() -> u64 {
    DEFAULT_STOP_TIMEOUT.as_secs() * 1000
}

const fn default_true() -> bool {
    true
}

/// A stage that runs one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    /// Unique stage name.
    pub name: String,
    /// Command run on each attempt.
    pub command: CommandSpec,
    /// Budget for the stage, retries included.
    #[serde(default = "default_stage_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Whether a failure aborts the run.
    #[serde(default = "default_true")]
    pub critical: bool,
    /// Whether failures may be retried at all.
    #[serde(default = "default_true")]
    pub retryable: bool,
    /// Whether the stage needs the worker up and healthy.
    #[serde(default)]
    pub requires_worker: bool,
    /// Exit codes treated as transient failures.
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,
}

impl StagePlan {
    /// Builds the runnable stage.
    #[must_use]
    pub fn to_stage(&self) -> Stage {
        let body = CommandStage::new(self.command.clone())
            .with_transient_exit_codes(self.transient_exit_codes.clone());
        Stage::new(self.name.clone(), body)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_attempts(self.max_attempts)
            .with_critical(self.critical)
            .with_retryable(self.retryable)
            .with_requires_worker(self.requires_worker)
    }
}

/// The long-lived worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPlan {
    /// Worker name, used in logs and cleanup ids.
    pub name: String,
    /// Command that runs the worker.
    pub command: CommandSpec,
    /// HTTP endpoint that must answer for the worker to be healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_url: Option<String>,
    /// How long stopping may take.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl WorkerPlan {
    /// Builds the worker.
    #[must_use]
    pub fn to_worker(&self) -> CommandWorker {
        let worker = CommandWorker::new(self.name.clone(), self.command.clone())
            .with_stop_timeout(Duration::from_millis(self.stop_timeout_ms));
        match &self.probe_url {
            Some(url) => worker.with_probe_url(url.clone()),
            None => worker,
        }
    }
}

/// A complete pipeline plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    /// Pipeline name.
    pub name: String,
    /// Global budget for the run.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional shared worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerPlan>,
    /// Stages, run in order.
    pub stages: Vec<StagePlan>,
    /// Supervisor settings; defaults apply when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<SupervisorConfig>,
}

impl PipelinePlan {
    /// Reads and validates a plan file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, a serialization error
    /// if it is not a valid plan, or a config error if validation fails.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SupervisorError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Parses and validates a plan.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON or a config error if
    /// validation fails.
    pub fn from_json_str(text: &str) -> Result<Self, SupervisorError> {
        let plan: Self = serde_json::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Checks the plan can be run.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the first problem found.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.name.trim().is_empty() {
            return Err(SupervisorError::config("pipeline name must not be empty"));
        }
        if self.timeout_ms == 0 {
            return Err(SupervisorError::config("timeout_ms must be positive"));
        }
        if self.stages.is_empty() {
            return Err(SupervisorError::config(format!(
                "pipeline '{}' has no stages",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(SupervisorError::config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.timeout_ms == 0 {
                return Err(SupervisorError::config(format!(
                    "stage '{}' must have a positive timeout_ms",
                    stage.name
                )));
            }
            if stage.command.program.trim().is_empty() {
                return Err(SupervisorError::config(format!(
                    "stage '{}' has an empty program",
                    stage.name
                )));
            }
            if stage.requires_worker && self.worker.is_none() {
                return Err(SupervisorError::config(format!(
                    "stage '{}' requires a worker but the plan defines none",
                    stage.name
                )));
            }
        }

        if let Some(worker) = &self.worker {
            if worker.command.program.trim().is_empty() {
                return Err(SupervisorError::config(format!(
                    "worker '{}' has an empty program",
                    worker.name
                )));
            }
        }

        if let Some(config) = &self.supervisor {
            config.validate()?;
        }
        Ok(())
    }

    /// Global budget for the run.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builds the runnable stages.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        self.stages.iter().map(StagePlan::to_stage).collect()
    }

    /// Builds the worker, if the plan has one.
    #[must_use]
    pub fn worker(&self) -> Option<Arc<dyn WorkerProcess>> {
        self.worker
            .as_ref()
            .map(|plan| Arc::new(plan.to_worker()) as Arc<dyn WorkerProcess>)
    }

    /// Supervisor settings with the plan's name applied.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        self.supervisor
            .clone()
            .unwrap_or_default()
            .with_pipeline_name(self.name.clone())
    }
}
