//! Cleanup manager for resources acquired during a pipeline run.
//!
//! Actions execute in LIFO order (last registered, first executed) to unwind
//! resource acquisition the way nested scopes would. Each action runs exactly
//! once: `run_all` is guarded by an atomic flag and late registrations are
//! rejected instead of silently missing the cleanup phase.

use crate::clock::{now_utc, Stopwatch, Timestamp};
use crate::errors::{panic_message, SupervisorError};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Boxed future returned by a cleanup action.
pub type CleanupFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type ActionFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// A registered cleanup action.
pub struct CleanupAction {
    id: String,
    seq: u64,
    registered_at: Timestamp,
    action: ActionFn,
}

impl CleanupAction {
    /// The action id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the action was registered.
    #[must_use]
    pub fn registered_at(&self) -> Timestamp {
        self.registered_at
    }
}

impl std::fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupAction")
            .field("id", &self.id)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

/// Handle identifying a registered action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CleanupHandle {
    seq: u64,
    id: String,
}

impl CleanupHandle {
    /// The id the action was registered under.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A cleanup action that failed, panicked or timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Id of the failing action.
    pub id: String,
    /// What went wrong.
    pub message: String,
}

/// Outcome of a cleanup phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    /// Number of actions invoked.
    pub executed: usize,
    /// Failures collected while running them.
    pub errors: Vec<CleanupFailure>,
}

/// Registry of cleanup actions, executed exactly once per run.
pub struct CleanupManager {
    actions: Mutex<Vec<CleanupAction>>,
    next_seq: AtomicU64,
    ran: AtomicBool,
    action_timeout: Duration,
}

impl Default for CleanupManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl CleanupManager {
    /// Creates a manager that gives each action at most `action_timeout`.
    #[must_use]
    pub fn new(action_timeout: Duration) -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            ran: AtomicBool::new(false),
            action_timeout,
        }
    }

    /// Registers a cleanup action.
    ///
    /// Fails with [`SupervisorError::CleanupClosed`] once `run_all` has run.
    pub fn register<F, Fut>(
        &self,
        id: impl Into<String>,
        action: F,
    ) -> Result<CleanupHandle, SupervisorError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.into();
        let mut actions = self.actions.lock();
        if self.ran.load(Ordering::SeqCst) {
            warn!(action = %id, "Cleanup already ran; rejecting registration");
            return Err(SupervisorError::CleanupClosed { id });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let boxed: ActionFn = Box::new(move || Box::pin(action()));
        actions.push(CleanupAction {
            id: id.clone(),
            seq,
            registered_at: now_utc(),
            action: boxed,
        });
        debug!(action = %id, pending = actions.len(), "Registered cleanup action");

        Ok(CleanupHandle { seq, id })
    }

    /// Withdraws an action whose resource was already released by its owner.
    ///
    /// Returns true if the action was still pending.
    pub fn release(&self, handle: &CleanupHandle) -> bool {
        let mut actions = self.actions.lock();
        let before = actions.len();
        actions.retain(|a| a.seq != handle.seq);
        actions.len() < before
    }

    /// Returns the number of pending actions.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.actions.lock().len()
    }

    /// Returns the ids of pending actions in registration order.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<String> {
        self.actions.lock().iter().map(|a| a.id.clone()).collect()
    }

    /// Returns true once `run_all` has been invoked.
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }

    /// Runs every registered action in LIFO order.
    ///
    /// Errors, panics and per-action timeouts are collected into the summary
    /// and never propagated. A second call is a no-op returning an empty
    /// summary.
    pub async fn run_all(&self) -> CleanupSummary {
        let actions: Vec<CleanupAction> = {
            let mut actions = self.actions.lock();
            if self
                .ran
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("Cleanup already ran; skipping");
                return CleanupSummary::default();
            }
            std::mem::take(&mut *actions)
        };

        let mut summary = CleanupSummary::default();

        for entry in actions.into_iter().rev() {
            let CleanupAction { id, action, .. } = entry;
            let timer = Stopwatch::start();
            summary.executed += 1;

            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(fut) => {
                    tokio::time::timeout(self.action_timeout, AssertUnwindSafe(fut).catch_unwind())
                        .await
                }
                Err(panic) => Ok(Err(panic)),
            };

            let failure = match outcome {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(format!("{e:#}")),
                Ok(Err(panic)) => Some(format!(
                    "Cleanup action panicked: {}",
                    panic_message(panic.as_ref())
                )),
                Err(_) => Some(format!(
                    "Cleanup action timed out after {}ms",
                    self.action_timeout.as_millis()
                )),
            };

            match failure {
                None => debug!(action = %id, elapsed_ms = timer.elapsed_ms(), "Cleanup action finished"),
                Some(message) => {
                    warn!(action = %id, error = %message, "Cleanup action failed");
                    summary.errors.push(CleanupFailure { id, message });
                }
            }
        }

        summary
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        let pending = self.actions.get_mut().len();
        if pending > 0 && !*self.ran.get_mut() {
            warn!(pending, "Cleanup manager dropped with actions that never ran");
        }
    }
}

impl std::fmt::Debug for CleanupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupManager")
            .field("pending_count", &self.pending_count())
            .field("has_run", &self.has_run())
            .finish()
    }
}
