//! Progress reporter trait and implementations.

use super::ProgressEvent;
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};

/// Observer of run progress.
///
/// Reporters never influence control flow. They are invoked synchronously
/// from the supervisor, so implementations should return quickly.
pub trait ProgressReporter: Send + Sync {
    /// Receives one event.
    fn emit(&self, event: &ProgressEvent);
}

/// A reporter that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReporter;

impl ProgressReporter for NoOpReporter {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// A reporter that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingReporter {
    level: Level,
}

impl Default for LoggingReporter {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingReporter {
    /// Creates a logging reporter at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging reporter.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl ProgressReporter for LoggingReporter {
    fn emit(&self, event: &ProgressEvent) {
        let event_type = event.event_type();
        let stage = event.stage_name().unwrap_or("-");
        let attempt = event.attempt().unwrap_or(0);

        match event {
            ProgressEvent::StageAttemptFailed {
                error, will_retry, ..
            } => {
                warn!(
                    event_type,
                    stage,
                    attempt,
                    error = %error,
                    will_retry,
                    "Stage attempt failed"
                );
            }
            ProgressEvent::StageFinished { result } => {
                info!(
                    event_type,
                    stage,
                    status = %result.status,
                    attempts = result.attempts,
                    duration_ms = result.duration_ms,
                    "Stage finished"
                );
            }
            ProgressEvent::PipelineFinished { report } => {
                info!(
                    event_type,
                    run_id = %report.run_id,
                    status = %report.overall_status,
                    duration_ms = report.duration_ms,
                    "Pipeline finished"
                );
            }
            _ if self.level == Level::DEBUG => {
                debug!(event_type, stage, attempt, event = ?event, "Event: {}", event_type);
            }
            _ => {
                info!(event_type, stage, attempt, "Event: {}", event_type);
            }
        }
    }
}

/// A collecting reporter for tests.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: RwLock<Vec<ProgressEvent>>,
}

impl CollectingReporter {
    /// Creates an empty collecting reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event types, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.read().iter().map(ProgressEvent::event_type).collect()
    }

    /// Returns events belonging to one stage.
    #[must_use]
    pub fn events_for_stage(&self, stage: &str) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage_name() == Some(stage))
            .cloned()
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl ProgressReporter for CollectingReporter {
    fn emit(&self, event: &ProgressEvent) {
        self.events.write().push(event.clone());
    }
}

/// Forwards every event to several reporters, each behind its own guard.
#[derive(Default)]
pub struct FanOutReporter {
    reporters: Vec<SafeReporter>,
}

impl FanOutReporter {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reporter.
    #[must_use]
    pub fn with(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporters.push(SafeReporter::new(reporter));
        self
    }

    /// Returns the number of reporters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    /// Returns true if no reporters are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl ProgressReporter for FanOutReporter {
    fn emit(&self, event: &ProgressEvent) {
        for reporter in &self.reporters {
            reporter.emit(event);
        }
    }
}

/// Writes each event as one JSON object per line.
pub struct JsonLinesReporter<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesReporter<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesReporter<std::io::Stdout> {
    /// Creates a reporter writing to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ProgressReporter for JsonLinesReporter<W> {
    fn emit(&self, event: &ProgressEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "Failed to serialize progress event");
                return;
            }
        };

        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(event_type = event.event_type(), error = %e, "Failed to write progress event");
        }
    }
}

/// Guard that isolates the supervisor from a misbehaving reporter.
///
/// A panicking reporter is logged and the event dropped.
#[derive(Clone)]
pub struct SafeReporter {
    inner: Arc<dyn ProgressReporter>,
}

impl SafeReporter {
    /// Wraps a reporter.
    #[must_use]
    pub fn new(inner: Arc<dyn ProgressReporter>) -> Self {
        Self { inner }
    }
}

impl Default for SafeReporter {
    fn default() -> Self {
        Self::new(Arc::new(NoOpReporter))
    }
}

impl ProgressReporter for SafeReporter {
    fn emit(&self, event: &ProgressEvent) {
        if let Err(e) = catch_unwind(AssertUnwindSafe(|| self.inner.emit(event))) {
            warn!(
                event_type = event.event_type(),
                panic = %crate::errors::panic_message(e.as_ref()),
                "Progress reporter panicked; event dropped"
            );
        }
    }
}

impl std::fmt::Debug for SafeReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeReporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(stage: &str, attempt: u32) -> ProgressEvent {
        ProgressEvent::StageStarted {
            stage: stage.to_string(),
            attempt,
            elapsed_ms: 0,
        }
    }

    struct PanickingReporter;

    impl ProgressReporter for PanickingReporter {
        fn emit(&self, _event: &ProgressEvent) {
            panic!("reporter exploded");
        }
    }

    #[test]
    fn test_noop_and_logging_reporters() {
        NoOpReporter.emit(&started("login", 1));
        LoggingReporter::default().emit(&started("login", 1));
        LoggingReporter::debug().emit(&started("login", 2));
        // Should not panic
    }

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::new();
        assert!(reporter.is_empty());

        reporter.emit(&started("login", 1));
        reporter.emit(&started("capture", 1));
        reporter.emit(&ProgressEvent::CleanupStarted {
            pending: 0,
            elapsed_ms: 5,
        });

        assert_eq!(reporter.len(), 3);
        assert_eq!(
            reporter.event_types(),
            vec!["stage.started", "stage.started", "cleanup.started"]
        );
        assert_eq!(reporter.events_for_stage("capture").len(), 1);
    }

    #[test]
    fn test_safe_reporter_swallows_panics() {
        let reporter = SafeReporter::new(Arc::new(PanickingReporter));
        reporter.emit(&started("login", 1));
    }

    #[test]
    fn test_fan_out_isolates_panicking_reporter() {
        let collector = Arc::new(CollectingReporter::new());
        let fan_out = FanOutReporter::new()
            .with(Arc::new(PanickingReporter))
            .with(collector.clone());

        fan_out.emit(&started("login", 1));

        assert_eq!(fan_out.len(), 2);
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn test_json_lines_reporter() {
        let reporter = JsonLinesReporter::new(Vec::new());
        reporter.emit(&started("login", 1));
        reporter.emit(&started("login", 2));

        let output = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "stage_started");
        assert_eq!(lines[1]["attempt"], 2);
    }
}
