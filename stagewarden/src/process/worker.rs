//! Worker backed by a long-lived child process.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::CommandSpec;
use crate::errors::WorkerError;
use crate::worker::WorkerProcess;

/// Default time a worker gets to exit after being killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A child process used as a worker (browser session, encoder daemon).
///
/// The probe fails once the process has exited. With a probe URL it also
/// requires the endpoint to answer with a success status.
#[derive(Debug)]
pub struct CommandWorker {
    name: String,
    spec: CommandSpec,
    probe_url: Option<String>,
    stop_timeout: Duration,
    child: Mutex<Option<Child>>,
    #[cfg(feature = "http-probe")]
    http: reqwest::Client,
}

impl CommandWorker {
    /// Creates a worker that runs `spec` when started.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            probe_url: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            child: Mutex::new(None),
            #[cfg(feature = "http-probe")]
            http: reqwest::Client::new(),
        }
    }

    /// Sets an HTTP endpoint the probe must reach.
    #[must_use]
    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = Some(url.into());
        self
    }

    /// Sets how long `stop` waits for the process to exit.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Returns the command.
    #[must_use]
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Returns the OS process id while the child is held.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    #[cfg(feature = "http-probe")]
    async fn probe_http(&self, url: &str) -> Result<(), WorkerError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| WorkerError::probe(&self.name, format!("GET {url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WorkerError::probe(
                &self.name,
                format!("GET {url} returned {status}"),
            ))
        }
    }

    #[cfg(not(feature = "http-probe"))]
    async fn probe_http(&self, url: &str) -> Result<(), WorkerError> {
        Err(WorkerError::probe(
            &self.name,
            format!("cannot probe {url}: built without the `http-probe` feature"),
        ))
    }
}

#[async_trait]
impl WorkerProcess for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), WorkerError> {
        let mut guard = self.child.lock().await;

        if let Some(child) = guard.as_mut() {
            match child.try_wait() {
                Ok(None) => {
                    debug!(worker = %self.name, "Worker process already running");
                    return Ok(());
                }
                Ok(Some(status)) => {
                    debug!(worker = %self.name, %status, "Replacing exited worker process");
                }
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Failed to poll worker process");
                }
            }
        }

        let child = self
            .spec
            .command()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| WorkerError::start(&self.name, format!("{}: {e}", self.spec.program)))?;

        info!(worker = %self.name, pid = ?child.id(), command = %self.spec, "Worker process spawned");
        *guard = Some(child);
        Ok(())
    }

    async fn probe(&self) -> Result<(), WorkerError> {
        {
            let mut guard = self.child.lock().await;
            let child = guard
                .as_mut()
                .ok_or_else(|| WorkerError::not_running(&self.name))?;

            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    return Err(WorkerError::probe(
                        &self.name,
                        format!("process exited with {status}"),
                    ));
                }
                Err(e) => return Err(WorkerError::probe(&self.name, e.to_string())),
            }
        }

        match &self.probe_url {
            Some(url) => self.probe_http(url).await,
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        let Some(mut child) = self.child.lock().await.take() else {
            debug!(worker = %self.name, "Stop requested with no worker process");
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(worker = %self.name, %status, "Worker process had already exited");
            return Ok(());
        }

        if let Err(e) = child.start_kill() {
            return Err(WorkerError::stop(&self.name, e.to_string()));
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(worker = %self.name, %status, "Worker process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(WorkerError::stop(&self.name, e.to_string())),
            Err(_) => Err(WorkerError::stop(
                &self.name,
                format!(
                    "process did not exit within {}ms",
                    self.stop_timeout.as_millis()
                ),
            )),
        }
    }
}
