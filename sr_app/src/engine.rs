//! Model engines run as child processes speaking JSON lines.
//!
//! The engine loads its model on start and prints one reply line when it is
//! ready. After that every request line gets exactly one reply line:
//!
//! ```text
//! -> {"prompt": "...", "output": "/tmp/.partial-x.png", "seed": 1042}
//! <- {"ok": true}
//! <- {"ok": false, "error": "CUDA out of memory"}
//! ```
//!
//! A request that times out leaves the engine owing a reply, so the process
//! is killed and a fresh one is started before the next request.
//!
//! Closing stdin asks the engine to exit. The model's memory belongs to the
//! process, so once the process is gone the memory is released, which is
//! what the resource manager waits for.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sr_gpu::{ModelHandle, ResourceError};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to start engine `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine `{0}` closed its output")]
    Closed(String),
    #[error("engine i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine sent an invalid reply: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("engine reported failure: {0}")]
    Rejected(String),
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
}

/// Program and arguments used to start an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl EngineCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineReply {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EngineReply {
    pub fn text(&self) -> Option<&str> {
        self.fields.get("text").and_then(Value::as_str)
    }
}

pub struct EngineProcess {
    command: EngineCommand,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    load_timeout: Duration,
    request_timeout: Duration,
    shutdown_grace: Duration,
    // set after a timeout; the next request restarts the engine
    stale: bool,
}

impl EngineProcess {
    /// Start the engine and wait for its ready line.
    ///
    /// # Errors
    /// `Spawn` if the program cannot start, `Timeout` if loading takes longer
    /// than `load_timeout`, `Rejected` if the engine reports a load failure.
    pub async fn spawn(
        command: &EngineCommand,
        load_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, EngineError> {
        tracing::info!(engine = %command.program, "starting engine");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Closed(command.program.clone()))?;

        let mut engine = Self {
            command: command.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            load_timeout,
            request_timeout,
            shutdown_grace: Duration::from_secs(10),
            stale: false,
        };

        engine.read_reply(load_timeout).await?;
        tracing::info!(engine = %engine.command.program, "engine ready");
        Ok(engine)
    }

    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn program(&self) -> String {
        self.command.program.clone()
    }

    /// Send one request and wait for its reply.
    ///
    /// # Errors
    /// `Rejected` when the engine answers `ok: false`, `Closed` if it exited,
    /// `Timeout` if it does not answer in time. After a `Timeout` the engine
    /// is killed and restarted by the next call.
    pub async fn request<R: Serialize>(
        &mut self,
        request: &R,
    ) -> Result<EngineReply, EngineError> {
        if self.stale {
            self.restart().await?;
        }

        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EngineError::Closed(self.command.program.clone()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        match self.read_reply(self.request_timeout).await {
            Err(EngineError::Timeout(limit)) => {
                self.abandon().await;
                Err(EngineError::Timeout(limit))
            }
            other => other,
        }
    }

    // the late reply would be read as the answer to the next request
    async fn abandon(&mut self) {
        tracing::warn!(engine = %self.command.program, "engine timed out, killing it");
        self.stale = true;
        drop(self.stdin.take());
        if let Err(err) = self.child.kill().await {
            tracing::warn!(engine = %self.command.program, "failed to kill engine: {err}");
        }
    }

    async fn restart(&mut self) -> Result<(), EngineError> {
        tracing::info!(engine = %self.command.program, "restarting engine");
        let fresh = Self::spawn(&self.command, self.load_timeout, self.request_timeout)
            .await?
            .with_shutdown_grace(self.shutdown_grace);
        *self = fresh;
        Ok(())
    }

    async fn read_reply(&mut self, timeout: Duration) -> Result<EngineReply, EngineError> {
        let line = tokio::time::timeout(timeout, self.stdout.next_line())
            .await
            .map_err(|_| EngineError::Timeout(timeout))??
            .ok_or_else(|| EngineError::Closed(self.program()))?;

        let reply: EngineReply = serde_json::from_str(&line)?;
        if reply.ok {
            Ok(reply)
        } else {
            Err(EngineError::Rejected(
                reply.error.unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }

    /// Close stdin and wait for the engine to exit, killing it after the
    /// grace period.
    ///
    /// # Errors
    /// `Io` if the process cannot be waited on or killed.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        drop(self.stdin.take());

        match tokio::time::timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(status) => {
                tracing::debug!(engine = %self.command.program, "engine exited with {}", status?);
            }
            Err(_) => {
                tracing::warn!(
                    engine = %self.command.program,
                    "engine did not exit within {:?}, killing it",
                    self.shutdown_grace
                );
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

impl ModelHandle for EngineProcess {
    async fn release(self) -> Result<(), ResourceError> {
        let name = self.program();
        self.shutdown().await.map_err(|err| ResourceError::Release {
            name,
            reason: err.to_string(),
        })
    }
}
