//! Long-lived worker processes shared across stages.
//!
//! The [`WorkerSlot`] owns the worker handle. It starts the worker on first
//! use, pairs it with a [`HealthMonitor`] and registers the teardown with the
//! run's cleanup manager at acquisition time.

use crate::cancellation::{CleanupHandle, CleanupManager};
use crate::clock::Deadline;
use crate::errors::WorkerError;
use crate::health::{HealthConfig, HealthMonitor, Probe};
use crate::pipeline::SupervisorConfig;
use crate::stages::StageError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Start/probe/stop contract of an external worker (browser session,
/// encoder daemon, ...). The implementor owns its process handle.
#[async_trait]
pub trait WorkerProcess: Send + Sync + Debug {
    /// Worker name, used in logs and cleanup ids.
    fn name(&self) -> &str;

    /// Starts the worker.
    async fn start(&self) -> Result<(), WorkerError>;

    /// Checks the worker is alive and answering.
    async fn probe(&self) -> Result<(), WorkerError>;

    /// Stops the worker.
    async fn stop(&self) -> Result<(), WorkerError>;
}

/// Adapts a [`WorkerProcess`] to the [`Probe`] interface.
#[derive(Debug, Clone)]
pub struct WorkerProbe {
    worker: Arc<dyn WorkerProcess>,
}

impl WorkerProbe {
    /// Wraps a worker.
    #[must_use]
    pub fn new(worker: Arc<dyn WorkerProcess>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl Probe for WorkerProbe {
    async fn probe(&self) -> Result<(), WorkerError> {
        self.worker.probe().await
    }
}

#[derive(Default)]
struct SlotState {
    monitor: Option<Arc<HealthMonitor>>,
    cleanup: Option<CleanupHandle>,
    starts: u32,
}

/// Lazily started worker plus its health monitor.
pub struct WorkerSlot {
    worker: Arc<dyn WorkerProcess>,
    health: HealthConfig,
    start_timeout: Duration,
    state: Mutex<SlotState>,
}

impl WorkerSlot {
    /// Creates a slot with default health settings.
    #[must_use]
    pub fn new(worker: Arc<dyn WorkerProcess>) -> Self {
        Self::from_config(worker, &SupervisorConfig::default())
    }

    /// Creates a slot using the supervisor's health and start settings.
    #[must_use]
    pub fn from_config(worker: Arc<dyn WorkerProcess>, config: &SupervisorConfig) -> Self {
        Self {
            worker,
            health: config.health_config(),
            start_timeout: config.worker_start_timeout(),
            state: Mutex::new(SlotState::default()),
        }
    }

    /// Overrides the health settings.
    #[must_use]
    pub fn with_health_config(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Overrides the start timeout.
    #[must_use]
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.worker.name()
    }

    /// The current health monitor, if the worker is running.
    pub async fn monitor(&self) -> Option<Arc<HealthMonitor>> {
        self.state.lock().await.monitor.clone()
    }

    /// Number of successful starts, restarts included.
    pub async fn starts(&self) -> u32 {
        self.state.lock().await.starts
    }

    /// Returns the running worker's monitor, starting the worker if needed.
    ///
    /// # Errors
    ///
    /// A `ResourceUnavailable` stage error when the worker cannot be started
    /// within the start timeout or the remaining deadline.
    pub async fn ensure_started(
        &self,
        cleanup: &CleanupManager,
        deadline: &Deadline,
    ) -> Result<Arc<HealthMonitor>, StageError> {
        let mut state = self.state.lock().await;
        if let Some(monitor) = &state.monitor {
            return Ok(Arc::clone(monitor));
        }
        self.launch(&mut state, cleanup, deadline).await
    }

    /// Stops the worker and starts it again.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_started`](Self::ensure_started).
    pub async fn restart(
        &self,
        cleanup: &CleanupManager,
        deadline: &Deadline,
    ) -> Result<Arc<HealthMonitor>, StageError> {
        let mut state = self.state.lock().await;
        info!(worker = %self.name(), "Restarting worker");

        if let Some(monitor) = state.monitor.take() {
            monitor.stop();
        }
        if let Some(handle) = state.cleanup.take() {
            cleanup.release(&handle);
        }
        self.stop_within(deadline, "restart").await;

        self.launch(&mut state, cleanup, deadline).await
    }

    /// How long a stage may wait for the worker to report healthy before
    /// the slot is considered stuck and worth restarting.
    #[must_use]
    pub fn health_wait(&self) -> Duration {
        self.health
            .interval
            .saturating_mul(self.health.unhealthy_threshold)
            .saturating_add(self.health.probe_timeout)
    }

    /// Stops the worker without outliving `deadline` or the start timeout.
    async fn stop_within(&self, deadline: &Deadline, during: &str) {
        let budget = deadline.remaining().min(self.start_timeout);
        match tokio::time::timeout(budget, self.worker.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(worker = %self.name(), error = %e, during, "Worker stop failed");
            }
            Err(_) => {
                warn!(
                    worker = %self.name(),
                    budget_ms = crate::clock::duration_ms(budget),
                    during,
                    "Worker stop timed out"
                );
            }
        }
    }

    async fn launch(
        &self,
        state: &mut SlotState,
        cleanup: &CleanupManager,
        deadline: &Deadline,
    ) -> Result<Arc<HealthMonitor>, StageError> {
        let name = self.name().to_string();
        let budget = deadline.remaining().min(self.start_timeout);

        match tokio::time::timeout(budget, self.worker.start()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(worker = %name, error = %e, "Worker failed to start");
                return Err(
                    StageError::resource_unavailable(format!("worker '{name}' failed to start"))
                        .with_cause(e),
                );
            }
            Err(_) => {
                warn!(
                    worker = %name,
                    budget_ms = crate::clock::duration_ms(budget),
                    "Worker start timed out"
                );
                self.stop_within(deadline, "start timeout").await;
                return Err(StageError::resource_unavailable(format!(
                    "worker '{name}' did not start within {}ms",
                    crate::clock::duration_ms(budget)
                )));
            }
        }

        let monitor = HealthMonitor::new(name.clone(), self.health);
        monitor.start(Arc::new(WorkerProbe::new(Arc::clone(&self.worker))));

        let teardown_monitor = Arc::clone(&monitor);
        let teardown_worker = Arc::clone(&self.worker);
        let registered = cleanup.register(format!("worker:{name}"), move || async move {
            teardown_monitor.stop();
            teardown_worker.stop().await.map_err(anyhow::Error::from)
        });

        match registered {
            Ok(handle) => {
                state.cleanup = Some(handle);
                state.monitor = Some(Arc::clone(&monitor));
                state.starts += 1;
                info!(worker = %name, starts = state.starts, "Worker started");
                Ok(monitor)
            }
            Err(e) => {
                monitor.stop();
                self.stop_within(deadline, "rejected registration").await;
                Err(StageError::resource_unavailable(format!(
                    "worker '{name}' started after cleanup began"
                ))
                .with_cause(e))
            }
        }
    }
}

impl Debug for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("worker", &self.worker)
            .field("health", &self.health)
            .field("start_timeout", &self.start_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageErrorKind;
    use crate::testing::ScriptedWorker;

    fn slot(worker: Arc<ScriptedWorker>) -> WorkerSlot {
        WorkerSlot::new(worker).with_health_config(HealthConfig {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            unhealthy_threshold: 1,
        })
    }

    #[tokio::test]
    async fn test_ensure_started_starts_once_and_registers_cleanup() {
        let worker = Arc::new(ScriptedWorker::new("browser"));
        let slot = slot(worker.clone());
        let cleanup = CleanupManager::default();
        let deadline = Deadline::after(Duration::from_secs(5));

        let first = slot.ensure_started(&cleanup, &deadline).await.unwrap();
        let second = slot.ensure_started(&cleanup, &deadline).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(worker.start_calls(), 1);
        assert_eq!(cleanup.pending_ids(), vec!["worker:browser".to_string()]);

        let summary = cleanup.run_all().await;
        assert_eq!(summary.executed, 1);
        assert!(summary.errors.is_empty());
        assert_eq!(worker.stop_calls(), 1);
        assert!(!first.is_running());
    }

    #[tokio::test]
    async fn test_start_failure_is_resource_unavailable() {
        let worker = Arc::new(ScriptedWorker::new("encoder").failing_start(1));
        let slot = slot(worker.clone());
        let cleanup = CleanupManager::default();
        let deadline = Deadline::after(Duration::from_secs(5));

        let err = slot.ensure_started(&cleanup, &deadline).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::ResourceUnavailable);
        assert_eq!(cleanup.pending_count(), 0);

        slot.ensure_started(&cleanup, &deadline).await.unwrap();
        assert_eq!(slot.starts().await, 1);
    }

    #[tokio::test]
    async fn test_restart_replaces_monitor_and_cleanup() {
        let worker = Arc::new(ScriptedWorker::new("browser"));
        let slot = slot(worker.clone());
        let cleanup = CleanupManager::default();
        let deadline = Deadline::after(Duration::from_secs(5));

        let first = slot.ensure_started(&cleanup, &deadline).await.unwrap();
        let second = slot.restart(&cleanup, &deadline).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_running());
        assert_eq!(slot.starts().await, 2);
        assert_eq!(cleanup.pending_count(), 1);

        cleanup.run_all().await;
        assert_eq!(worker.stop_calls(), 2);
    }

    #[tokio::test]
    async fn test_restart_with_hanging_stop_respects_deadline() {
        let worker = Arc::new(ScriptedWorker::new("browser").with_stop_delay(Duration::from_secs(3)));
        let slot = slot(worker.clone());
        let cleanup = CleanupManager::new(Duration::from_millis(50));
        let deadline = Deadline::after(Duration::from_millis(200));

        slot.ensure_started(&cleanup, &deadline).await.unwrap();
        let started = std::time::Instant::now();
        let _ = slot.restart(&cleanup, &deadline).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(worker.stop_calls() >= 1);
    }

    #[test]
    fn test_health_wait_covers_threshold_and_probe() {
        let slot = slot(Arc::new(ScriptedWorker::new("browser")));
        assert_eq!(slot.health_wait(), Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_registration_after_cleanup_stops_worker() {
        let worker = Arc::new(ScriptedWorker::new("browser"));
        let slot = slot(worker.clone());
        let cleanup = CleanupManager::default();
        cleanup.run_all().await;

        let deadline = Deadline::after(Duration::from_secs(5));
        let err = slot.ensure_started(&cleanup, &deadline).await.unwrap_err();

        assert_eq!(err.kind, StageErrorKind::ResourceUnavailable);
        assert_eq!(worker.stop_calls(), 1);
        assert!(slot.monitor().await.is_none());
    }
}
