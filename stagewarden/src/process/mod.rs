//! External commands as stages and workers.
//!
//! This module provides:
//! - [`CommandSpec`], a serializable description of a program invocation
//! - [`CommandStage`], a stage body that runs one command per attempt
//! - [`CommandWorker`], a long-lived child process used as a worker

mod stage;
mod worker;

pub use stage::CommandStage;
pub use worker::{CommandWorker, DEFAULT_STOP_TIMEOUT};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::stages::StageError;

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute, resolved through `PATH`.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Builds the tokio command. The child is killed if its handle is dropped.
    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Maps a spawn failure to a stage error.
///
/// A missing or non-executable program will not fix itself between attempts.
pub(crate) fn spawn_error(spec: &CommandSpec, err: &io::Error) -> StageError {
    let message = format!("failed to spawn '{}'", spec.program);
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            StageError::permanent(message).with_cause(err)
        }
        _ => StageError::transient(message).with_cause(err),
    }
}

/// Most bytes of stdout kept in a stage's output.
pub const STDOUT_TAIL: usize = 1024 * 1024;

/// Drains a child pipe, keeping at most the last `limit` bytes as lossy UTF-8.
///
/// The whole pipe is read so the child never blocks on a full buffer.
pub(crate) async fn read_tail<R>(pipe: Option<R>, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail: VecDeque<u8> = VecDeque::new();
    let mut chunk = [0u8; 8192];
    if let Some(mut pipe) = pipe {
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    tail.extend(&chunk[..n]);
                    let excess = tail.len().saturating_sub(limit);
                    tail.drain(..excess);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read child output");
                    break;
                }
            }
        }
    }
    let bytes: Vec<u8> = tail.into();
    String::from_utf8_lossy(&bytes).into_owned()
}
