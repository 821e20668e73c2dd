//! Stage body that runs an external command.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tracing::{debug, warn};

use super::{read_tail, spawn_error, CommandSpec, STDOUT_TAIL};
use crate::stages::{StageContext, StageError, StageFn};

/// Number of trailing stderr bytes kept in error causes.
const STDERR_TAIL: usize = 512;

/// Runs a [`CommandSpec`] once per attempt.
///
/// Exit code 0 succeeds with `{"exit_code": 0, "stdout": ...}`. Exit codes
/// listed in `transient_exit_codes` fail transiently, any other non-zero code
/// fails permanently. The child is killed as soon as the attempt is cancelled.
#[derive(Debug, Clone)]
pub struct CommandStage {
    spec: CommandSpec,
    transient_exit_codes: Vec<i32>,
}

impl CommandStage {
    /// Creates a command stage body.
    #[must_use]
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            transient_exit_codes: Vec::new(),
        }
    }

    /// Sets the exit codes that are worth retrying.
    #[must_use]
    pub fn with_transient_exit_codes(mut self, codes: impl Into<Vec<i32>>) -> Self {
        self.transient_exit_codes = codes.into();
        self
    }

    /// Returns the command.
    #[must_use]
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    fn exit_error(&self, code: Option<i32>, stderr: &str) -> StageError {
        let error = match code {
            Some(code) if self.transient_exit_codes.contains(&code) => StageError::transient(
                format!("'{}' exited with code {code}", self.spec.program),
            ),
            Some(code) => StageError::permanent(format!(
                "'{}' exited with code {code}",
                self.spec.program
            )),
            // Killed by a signal from outside the supervisor.
            None => StageError::transient(format!(
                "'{}' was terminated by a signal",
                self.spec.program
            )),
        };

        let tail = stderr_tail(stderr);
        if tail.is_empty() {
            error
        } else {
            error.with_cause(tail)
        }
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

#[async_trait]
impl StageFn for CommandStage {
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        debug!(
            stage = %ctx.stage_name(),
            attempt = ctx.attempt(),
            command = %self.spec,
            "Spawning command"
        );

        let mut child = self
            .spec
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.spec, &e))?;

        let stdout = tokio::spawn(read_tail(child.stdout.take(), STDOUT_TAIL));
        let stderr = tokio::spawn(read_tail(child.stderr.take(), STDERR_TAIL * 4));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                StageError::transient(format!("failed to wait for '{}'", self.spec.program))
                    .with_cause(e)
            })?,
            () = ctx.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(stage = %ctx.stage_name(), error = %e, "Failed to kill command");
                }
                let reason = ctx.cancel_reason().unwrap_or_else(|| "cancelled".to_string());
                return Err(StageError::timeout(format!(
                    "'{}' was killed: {reason}",
                    self.spec.program
                )));
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        if status.success() {
            Ok(json!({ "exit_code": 0, "stdout": stdout }))
        } else {
            Err(self.exit_error(status.code(), &stderr))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::stages::StageErrorKind;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    fn ctx() -> (StageContext, Arc<CancellationToken>) {
        let token = Arc::new(CancellationToken::new());
        (StageContext::new("cmd", 1, Arc::clone(&token)), token)
    }

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let (ctx, _token) = ctx();
        let output = CommandStage::new(sh("echo hello")).run(ctx).await.unwrap();
        assert_eq!(output["exit_code"], 0);
        assert_eq!(output["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn test_exit_code_classification() {
        let stage = CommandStage::new(sh("echo boom >&2; exit 75")).with_transient_exit_codes([75]);
        let (ctx1, _t1) = ctx();
        let err = stage.run(ctx1).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Transient);
        assert_eq!(err.cause.as_deref(), Some("boom"));

        let stage = CommandStage::new(sh("exit 3")).with_transient_exit_codes([75]);
        let (ctx2, _t2) = ctx();
        let err = stage.run(ctx2).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Permanent);
        assert!(err.message.contains("code 3"));
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let (ctx, _token) = ctx();
        let err = CommandStage::new(CommandSpec::new("stagewarden-no-such-program"))
            .run(ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let (ctx, token) = ctx();
        let stage = CommandStage::new(sh("sleep 30"));
        let started = Instant::now();

        let handle = tokio::spawn(async move { stage.run(ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel("stage 'cmd' timed out");

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Timeout);
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_large_stdout_is_truncated_to_tail() {
        let (ctx, _token) = ctx();
        let script = format!("head -c {} /dev/zero | tr '\\0' a; printf END", STDOUT_TAIL * 2);
        let output = CommandStage::new(sh(&script)).run(ctx).await.unwrap();
        let stdout = output["stdout"].as_str().unwrap();
        assert_eq!(stdout.len(), STDOUT_TAIL);
        assert!(stdout.ends_with("aaaEND"));
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let long = "x".repeat(STDERR_TAIL * 2);
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL);
        assert_eq!(stderr_tail("  short \n"), "short");
    }
}
