//! Continuous liveness monitoring of a long-lived worker.
//!
//! A [`HealthMonitor`] runs a background loop that probes the worker on a
//! fixed interval and publishes a [`HealthSnapshot`] through a watch channel.
//! Readers never block the loop and the loop never blocks readers.
//!
//! Health flips to unhealthy only after `unhealthy_threshold` consecutive
//! failed probes and back to healthy after a single success.

use crate::cancellation::CancellationToken;
use crate::clock::{now_utc, Deadline, Timestamp};
use crate::errors::{HealthWaitError, WorkerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A liveness check against a worker.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Returns `Ok(())` if the worker answered.
    async fn probe(&self) -> Result<(), WorkerError>;
}

/// Probe loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Time between probes.
    pub interval: Duration,
    /// Budget for one probe, independent of stage timeouts.
    pub probe_timeout: Duration,
    /// Consecutive failures before the worker is unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
        }
    }
}

/// Point-in-time view of worker health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Whether the worker is considered usable.
    pub healthy: bool,
    /// When the last probe completed; `None` before the first probe.
    pub last_checked_at: Option<Timestamp>,
    /// Last probe failure, if the latest probe failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of failed probes in a row.
    pub consecutive_failures: u32,
}

impl HealthSnapshot {
    /// Snapshot published before the first probe completes.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            healthy: true,
            last_checked_at: None,
            reason: None,
            consecutive_failures: 0,
        }
    }
}

/// Background prober for one worker.
pub struct HealthMonitor {
    name: String,
    config: HealthConfig,
    state: watch::Sender<HealthSnapshot>,
    failures: Mutex<u32>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<CancellationToken>,
}

impl HealthMonitor {
    /// Creates a monitor; call [`start`](Self::start) to begin probing.
    #[must_use]
    pub fn new(name: impl Into<String>, config: HealthConfig) -> Arc<Self> {
        let (state, _) = watch::channel(HealthSnapshot::initial());
        Arc::new(Self {
            name: name.into(),
            config: HealthConfig {
                unhealthy_threshold: config.unhealthy_threshold.max(1),
                ..config
            },
            state,
            failures: Mutex::new(0),
            task: Mutex::new(None),
            stop: Arc::new(CancellationToken::new()),
        })
    }

    /// Name of the monitored worker.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The monitor's settings.
    #[must_use]
    pub fn config(&self) -> HealthConfig {
        self.config
    }

    /// Spawns the probe loop.
    ///
    /// The first probe runs immediately. Calling `start` on a running or
    /// stopped monitor does nothing.
    pub fn start(self: &Arc<Self>, probe: Arc<dyn Probe>) {
        let mut task = self.task.lock();
        if task.is_some() || self.stop.is_cancelled() {
            debug!(worker = %self.name, "Health monitor already started");
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let stop = Arc::clone(&self.stop);
        let HealthConfig {
            interval,
            probe_timeout,
            ..
        } = self.config;
        let name = self.name.clone();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let outcome = match tokio::time::timeout(probe_timeout, probe.probe()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(WorkerError::ProbeTimeout {
                        timeout: probe_timeout,
                    }
                    .to_string()),
                };

                if stop.is_cancelled() {
                    break;
                }
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.record_probe(outcome);
            }

            debug!(worker = %name, "Health monitor loop exited");
        }));

        info!(
            worker = %self.name,
            interval_ms = crate::clock::duration_ms(interval),
            "Health monitor started"
        );
    }

    /// Applies one probe outcome and publishes the resulting snapshot.
    pub fn record_probe(&self, outcome: Result<(), String>) -> HealthSnapshot {
        let mut failures = self.failures.lock();
        let was_healthy = self.state.borrow().healthy;

        let snapshot = match outcome {
            Ok(()) => {
                *failures = 0;
                HealthSnapshot {
                    healthy: true,
                    last_checked_at: Some(now_utc()),
                    reason: None,
                    consecutive_failures: 0,
                }
            }
            Err(reason) => {
                *failures = failures.saturating_add(1);
                HealthSnapshot {
                    healthy: *failures < self.config.unhealthy_threshold,
                    last_checked_at: Some(now_utc()),
                    reason: Some(reason),
                    consecutive_failures: *failures,
                }
            }
        };

        match (was_healthy, snapshot.healthy) {
            (true, false) => warn!(
                worker = %self.name,
                consecutive_failures = snapshot.consecutive_failures,
                reason = snapshot.reason.as_deref().unwrap_or_default(),
                "Worker marked unhealthy"
            ),
            (false, true) => info!(worker = %self.name, "Worker healthy again"),
            _ => {}
        }

        self.state.send_replace(snapshot.clone());
        snapshot
    }

    /// Non-blocking read of the latest snapshot.
    #[must_use]
    pub fn current_health(&self) -> HealthSnapshot {
        self.state.borrow().clone()
    }

    /// Waits until the worker is healthy or the deadline expires.
    ///
    /// Returns immediately when the current snapshot is healthy.
    ///
    /// # Errors
    ///
    /// [`HealthWaitError::Timeout`] when the deadline expires first,
    /// [`HealthWaitError::Stopped`] when the monitor stops while unhealthy.
    pub async fn wait_for_healthy(&self, deadline: &Deadline) -> Result<(), HealthWaitError> {
        let mut rx = self.state.subscribe();

        loop {
            let reason = {
                let snapshot = rx.borrow_and_update();
                if snapshot.healthy {
                    return Ok(());
                }
                snapshot.reason.clone()
            };

            if self.stop.is_cancelled() {
                return Err(HealthWaitError::Stopped);
            }
            if deadline.expired() {
                return Err(HealthWaitError::Timeout { reason });
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(HealthWaitError::Stopped);
                    }
                }
                () = deadline.wait() => {
                    return Err(HealthWaitError::Timeout {
                        reason: self.current_health().reason,
                    });
                }
                () = self.stop.cancelled() => return Err(HealthWaitError::Stopped),
            }
        }
    }

    /// Stops the probe loop. Idempotent.
    pub fn stop(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel("health monitor stopped");
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!(worker = %self.name, "Health monitor stopped");
    }

    /// Returns true while the probe loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
            && self
                .task
                .lock()
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("health", &self.current_health())
            .finish_non_exhaustive()
    }
}
