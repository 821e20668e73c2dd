//! Scripted stages, workers and probes for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::WorkerError;
use crate::health::Probe;
use crate::stages::{Stage, StageContext, StageError, StageFn};
use crate::worker::WorkerProcess;

/// What a scripted stage does on one attempt.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return the value.
    Succeed(Value),
    /// Return the error.
    Fail(StageError),
    /// Sleep, then return the value.
    SucceedAfter(Duration, Value),
    /// Never return and ignore cancellation.
    Hang,
    /// Wait for cancellation, then return a timeout error.
    HangUntilCancelled,
    /// Panic with the message.
    Panic(String),
}

impl ScriptStep {
    /// Shorthand for [`ScriptStep::Succeed`].
    #[must_use]
    pub fn succeed(value: Value) -> Self {
        Self::Succeed(value)
    }

    /// Shorthand for [`ScriptStep::Fail`].
    #[must_use]
    pub fn fail(error: StageError) -> Self {
        Self::Fail(error)
    }
}

/// A stage body that plays back one [`ScriptStep`] per attempt.
///
/// The last step repeats once the script is exhausted.
#[derive(Debug)]
pub struct ScriptedStage {
    steps: Mutex<VecDeque<ScriptStep>>,
    last: Mutex<Option<ScriptStep>>,
    calls: AtomicUsize,
    cancelled: AtomicUsize,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedStage {
    /// Creates a scripted body.
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
        })
    }

    /// Builds a stage named `name` around this body.
    #[must_use]
    pub fn stage(self: &Arc<Self>, name: impl Into<String>) -> Stage {
        Stage::from_shared(name, Arc::clone(self) as Arc<dyn StageFn>)
    }

    /// Number of attempts made.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Attempt numbers seen in the stage context, in call order.
    #[must_use]
    pub fn seen_attempts(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }

    /// Number of attempts that observed cancellation.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` attempts observed cancellation.
    pub async fn wait_cancelled(&self, count: usize) {
        while self.cancelled_count() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn next_step(&self) -> ScriptStep {
        let mut last = self.last.lock();
        match self.steps.lock().pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last
                .clone()
                .unwrap_or_else(|| ScriptStep::Succeed(Value::Null)),
        }
    }
}

#[async_trait]
impl StageFn for ScriptedStage {
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().push(ctx.attempt());

        match self.next_step() {
            ScriptStep::Succeed(value) => Ok(value),
            ScriptStep::Fail(error) => Err(error),
            ScriptStep::SucceedAfter(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            ScriptStep::Hang => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
            ScriptStep::HangUntilCancelled => {
                ctx.cancelled().await;
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(StageError::timeout(
                    ctx.cancel_reason().unwrap_or_else(|| "cancelled".to_string()),
                ))
            }
            ScriptStep::Panic(message) => panic!("{message}"),
        }
    }
}

/// An in-memory worker with scriptable failures.
#[derive(Debug)]
pub struct ScriptedWorker {
    name: String,
    running: AtomicBool,
    healthy: AtomicBool,
    failing_starts: AtomicUsize,
    start_delay: Mutex<Option<Duration>>,
    stop_delay: Mutex<Option<Duration>>,
    heal_on_start: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl ScriptedWorker {
    /// Creates a healthy worker that starts instantly.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            failing_starts: AtomicUsize::new(0),
            start_delay: Mutex::new(None),
            stop_delay: Mutex::new(None),
            heal_on_start: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` starts fail.
    #[must_use]
    pub fn failing_start(self, count: usize) -> Self {
        self.failing_starts.store(count, Ordering::SeqCst);
        self
    }

    /// Makes every start take `delay`.
    #[must_use]
    pub fn with_start_delay(self, delay: Duration) -> Self {
        *self.start_delay.lock() = Some(delay);
        self
    }

    /// Makes every stop take `delay`.
    #[must_use]
    pub fn with_stop_delay(self, delay: Duration) -> Self {
        *self.stop_delay.lock() = Some(delay);
        self
    }

    /// Makes every successful start reset the probe outcome to healthy.
    #[must_use]
    pub fn healing_on_start(self) -> Self {
        self.heal_on_start.store(true, Ordering::SeqCst);
        self
    }

    /// Sets the probe outcome.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Returns true between a successful start and a stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of start calls, failed ones included.
    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Number of stop calls.
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of probe calls.
    #[must_use]
    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerProcess for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), WorkerError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(WorkerError::start(&self.name, "scripted start failure"));
        }

        if self.heal_on_start.load(Ordering::SeqCst) {
            self.healthy.store(true, Ordering::SeqCst);
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<(), WorkerError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_running() {
            return Err(WorkerError::not_running(&self.name));
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WorkerError::probe(&self.name, "scripted probe failure"))
        }
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A probe that plays back a fixed sequence of outcomes.
///
/// The last outcome repeats once the sequence is exhausted.
#[derive(Debug)]
pub struct ScriptedProbe {
    outcomes: Mutex<VecDeque<Result<(), String>>>,
    last: Mutex<Result<(), String>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    /// Creates a probe from `outcomes` (`Err` carries the failure reason).
    #[must_use]
    pub fn new(outcomes: Vec<Result<(), String>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            last: Mutex::new(Ok(())),
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of probes made.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self) -> Result<(), WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut last = self.last.lock();
            if let Some(next) = self.outcomes.lock().pop_front() {
                *last = next;
            }
            last.clone()
        };
        outcome.map_err(|reason| WorkerError::probe("scripted", reason))
    }
}
