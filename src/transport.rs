//! Line-framed duplex channel over a child process's stdin/stdout.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{AgentError, Result};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A framed, bidirectional message channel.
///
/// `receive` is driven by a single reader; `send` may be called concurrently
/// and each frame is written atomically.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one frame. The transport appends the delimiter.
    async fn send(&self, frame: &str) -> Result<()>;

    /// Wait for the next complete frame.
    async fn receive(&self) -> Result<String>;

    /// Release the underlying resources. Must be idempotent.
    async fn close(&self) -> Result<()>;
}

/// Transport that owns a spawned child process and speaks newline-delimited
/// frames over its stdio.
pub struct StdioTransport {
    command: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    shutdown_timeout: Duration,
    closed: AtomicBool,
    // Set while a frame is being written. Still set after a cancelled write,
    // meaning the pipe may hold half a frame.
    torn: Arc<AtomicBool>,
}

/// Clears the torn flag only if the write it guards ran to completion.
struct WriteGuard {
    torn: Arc<AtomicBool>,
    finished: bool,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.finished {
            self.torn.store(false, Ordering::SeqCst);
        }
    }
}

impl StdioTransport {
    /// Launch `command` with `args` and extra environment variables.
    pub fn start(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        if stdin.is_none() || stdout.is_none() {
            return Err(AgentError::Spawn {
                command: command.to_string(),
                source: std::io::Error::other("child stdio was not captured"),
            });
        }

        info!(command, pid = ?child.id(), "started tool server");

        Ok(Self {
            command: command.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            closed: AtomicBool::new(false),
            torn: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Ok(Self::start(&config.command, &config.args, &config.env)?
            .with_shutdown_timeout(config.shutdown_timeout()))
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Write("transport is closed".into()));
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| AgentError::Write("stdin not available".into()))?;

        if self.torn.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Write(
                "an earlier write was interrupted mid-frame".into(),
            ));
        }
        let mut write = WriteGuard {
            torn: Arc::clone(&self.torn),
            finished: false,
        };

        debug!(command = %self.command, frame, "-> tool server");
        let mut line = String::with_capacity(frame.len() + 1);
        line.push_str(frame);
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AgentError::Write(err.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|err| AgentError::Write(err.to_string()))?;
        write.finished = true;
        Ok(())
    }

    async fn receive(&self) -> Result<String> {
        let mut guard = self.stdout.lock().await;
        let stdout = guard.as_mut().ok_or(AgentError::Eof)?;

        let mut buf = Vec::new();
        loop {
            buf.clear();
            if stdout.read_until(b'\n', &mut buf).await? == 0 {
                return Err(AgentError::Eof);
            }
            let line = match String::from_utf8(std::mem::take(&mut buf)) {
                Ok(line) => line,
                Err(err) => {
                    warn!(command = %self.command, error = %err, "discarding non-UTF-8 line");
                    continue;
                }
            };
            let frame = line.trim_end_matches(['\r', '\n']);
            if frame.trim().is_empty() {
                continue;
            }
            debug!(command = %self.command, frame, "<- tool server");
            return Ok(frame.to_string());
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Closing stdin is the polite shutdown signal for stdio servers. A
        // writer stuck on a full pipe holds the lock, so kill the child to
        // release it.
        let stdin_closed = match tokio::time::timeout(self.shutdown_timeout, self.stdin.lock()).await {
            Ok(mut stdin) => {
                stdin.take();
                true
            }
            Err(_) => false,
        };

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if !stdin_closed {
                warn!(command = %self.command, "stdin is blocked by a stalled write, killing tool server");
                child.kill().await?;
            } else {
                match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
                    Ok(Ok(status)) => debug!(command = %self.command, %status, "tool server exited"),
                    Ok(Err(err)) => warn!(command = %self.command, error = %err, "failed to wait for tool server"),
                    Err(_) => {
                        warn!(
                            command = %self.command,
                            timeout = ?self.shutdown_timeout,
                            "tool server did not exit in time, killing it"
                        );
                        child.kill().await?;
                    }
                }
            }
        }

        // The reader may still be parked on stdout; it lets go on EOF.
        if let Ok(mut stdout) = self.stdout.try_lock() {
            stdout.take();
        }

        Ok(())
    }
}

/// In-process transport backed by unbounded channels.
///
/// The [`ChannelPeer`] half plays the tool server: it reads the frames the
/// session sends and pushes frames back.
pub struct ChannelTransport {
    outgoing: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<String>>,
}

pub struct ChannelPeer {
    requests: mpsc::UnboundedReceiver<String>,
    responses: Option<mpsc::UnboundedSender<String>>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                outgoing: std::sync::Mutex::new(Some(out_tx)),
                incoming: Mutex::new(in_rx),
            },
            ChannelPeer {
                requests: out_rx,
                responses: Some(in_tx),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: &str) -> Result<()> {
        let guard = self
            .outgoing
            .lock()
            .map_err(|_| AgentError::Write("channel lock poisoned".into()))?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| AgentError::Write("transport is closed".into()))?;
        sender
            .send(frame.to_string())
            .map_err(|_| AgentError::Write("peer hung up".into()))
    }

    async fn receive(&self) -> Result<String> {
        self.incoming.lock().await.recv().await.ok_or(AgentError::Eof)
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut guard) = self.outgoing.lock() {
            guard.take();
        }
        Ok(())
    }
}

impl ChannelPeer {
    /// Next frame written by the transport owner, decoded as JSON.
    /// `None` once the transport is closed.
    pub async fn next_frame(&mut self) -> Option<serde_json::Value> {
        let line = self.requests.recv().await?;
        serde_json::from_str(&line).ok()
    }

    /// Push a raw line to the transport owner.
    pub fn push_raw(&self, line: impl Into<String>) {
        if let Some(responses) = &self.responses {
            let _ = responses.send(line.into());
        }
    }

    pub fn push(&self, frame: serde_json::Value) {
        self.push_raw(frame.to_string());
    }

    /// Simulate the server closing its output stream.
    pub fn hang_up(&mut self) {
        self.responses.take();
    }
}
