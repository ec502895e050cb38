//! Pipes the extraction tool's muxed output straight into a response body.
//!
//! A stream request moves through
//! `Pending → ProcessSpawned → HeaderSent → Streaming → {Completed | Aborted}`.
//! Headers are only committed once the tool has produced its first chunk, so
//! a tool that fails up front still gets a proper error status. Afterwards the
//! only way to signal failure is to break the body, which drops the
//! connection before the chunked terminator is written.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::config::ServerConfig;
use crate::extract::{launch_error, tool_command, tool_error_message};

const CHUNK_SIZE: usize = 128 * 1024;
const STDERR_LIMIT: usize = 64 * 1024;
const STDERR_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("{0}")]
    Launch(String),
    #[error("Stream failed: {0}")]
    ToolFailed(String),
    #[error("Extraction tool produced no output")]
    EmptyOutput,
    #[error("Stream read failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Pending,
    ProcessSpawned,
    HeaderSent,
    Streaming,
    Completed,
    Aborted,
}

impl StreamPhase {
    fn finished(self) -> bool {
        matches!(self, StreamPhase::Completed | StreamPhase::Aborted)
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamPhase::Pending => "pending",
            StreamPhase::ProcessSpawned => "process_spawned",
            StreamPhase::HeaderSent => "header_sent",
            StreamPhase::Streaming => "streaming",
            StreamPhase::Completed => "completed",
            StreamPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

// ── Process handle ───────────────────────────────────────────────────────────

/// Owns the tool process for as long as its output is relayed.
///
/// Dropping the guard kills a process that is still running and reaps it in
/// the background, whichever path the request took to get there.
pub struct ProcessGuard {
    child: Option<Child>,
}

impl ProcessGuard {
    pub fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Wait for a normal exit. Cancel-safe: an interrupted wait leaves the
    /// process owned by the guard.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = match self.child.as_mut() {
            Some(child) => child.wait().await?,
            None => return Err(io::Error::new(io::ErrorKind::Other, "process already reaped")),
        };
        self.child = None;
        Ok(status)
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        tracing::debug!(pid = ?child.id(), "killing extraction tool");
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            kill_process_group(pid);
        }
        if let Err(e) = child.start_kill() {
            tracing::warn!("failed to kill extraction tool: {}", e);
        }
        // Without a runtime the child's kill_on_drop and tokio's orphan
        // reaper take over.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}

/// The tool was spawned as a group leader, so its pid is also the group id.
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, "failed to kill extraction tool group: {}", e),
    }
}

// ── Relay ────────────────────────────────────────────────────────────────────

pub struct Relay {
    process: ProcessGuard,
    stdout: ReaderStream<ChildStdout>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    first: Option<Bytes>,
    phase: StreamPhase,
    bytes_sent: u64,
    url: String,
}

/// Spawn the tool with `selection` and wait for its first chunk of output.
pub async fn open(config: &ServerConfig, url: &str, selection: &str) -> Result<Relay, StreamError> {
    let mut cmd = tool_command(config);
    cmd.args([
        "--quiet",
        "--no-warnings",
        "--no-playlist",
        "-f",
        selection,
        "--merge-output-format",
        "mp4",
    ]);
    if let Some(ffmpeg) = &config.ffmpeg_path {
        cmd.arg("--ffmpeg-location").arg(ffmpeg);
    }
    cmd.args(["-o", "-", url])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| StreamError::Launch(launch_error(config, &e)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| StreamError::Launch("Extraction tool stdout was not captured".to_string()))?;
    let stderr = child.stderr.take().map(drain_stderr);

    let mut relay = Relay {
        process: ProcessGuard::new(child),
        stdout: ReaderStream::with_capacity(stdout, CHUNK_SIZE),
        stderr,
        first: None,
        phase: StreamPhase::Pending,
        bytes_sent: 0,
        url: url.to_string(),
    };
    relay.advance(StreamPhase::ProcessSpawned);
    tracing::info!(url, selection, pid = ?relay.process.id(), "stream started");

    relay.prime().await?;
    Ok(relay)
}

impl Relay {
    /// Body stream yielding the tool's output. Ends with an error if the tool
    /// dies after output began. Called once the response head is built.
    pub fn into_stream(mut self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        self.advance(StreamPhase::HeaderSent);
        futures::stream::unfold(self, |mut relay| async move {
            relay.next_chunk().await.map(|item| (item, relay))
        })
    }

    fn advance(&mut self, phase: StreamPhase) {
        tracing::debug!(url = %self.url, from = %self.phase, to = %phase, "stream phase");
        self.phase = phase;
    }

    async fn prime(&mut self) -> Result<(), StreamError> {
        match self.stdout.next().await {
            Some(Ok(chunk)) => {
                self.first = Some(chunk);
                Ok(())
            }
            Some(Err(e)) => {
                self.advance(StreamPhase::Aborted);
                Err(StreamError::Io(e))
            }
            None => {
                let status = self.process.wait().await;
                let message = self.stderr_message().await;
                self.advance(StreamPhase::Aborted);
                match status {
                    Ok(status) if status.success() => Err(StreamError::EmptyOutput),
                    Ok(status) => Err(StreamError::ToolFailed(message.unwrap_or_else(|| {
                        format!("extraction tool exited with {}", status)
                    }))),
                    Err(e) => Err(StreamError::Io(e)),
                }
            }
        }
    }

    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.phase.finished() {
            return None;
        }
        if self.phase == StreamPhase::HeaderSent {
            self.advance(StreamPhase::Streaming);
        }

        let next = match self.first.take() {
            Some(first) => Some(Ok(first)),
            None => self.stdout.next().await,
        };

        match next {
            Some(Ok(chunk)) => {
                self.bytes_sent += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                tracing::warn!(url = %self.url, bytes = self.bytes_sent, "stream read failed: {}", e);
                self.advance(StreamPhase::Aborted);
                Some(Err(e))
            }
            None => self.finish().await,
        }
    }

    async fn finish(&mut self) -> Option<io::Result<Bytes>> {
        let status = match self.process.wait().await {
            Ok(status) => status,
            Err(e) => {
                self.advance(StreamPhase::Aborted);
                return Some(Err(e));
            }
        };

        if status.success() {
            self.advance(StreamPhase::Completed);
            tracing::info!(url = %self.url, bytes = self.bytes_sent, "stream completed");
            return None;
        }

        let message = self
            .stderr_message()
            .await
            .unwrap_or_else(|| format!("extraction tool exited with {}", status));
        tracing::warn!(url = %self.url, bytes = self.bytes_sent, %message, "stream died mid-transfer");
        self.advance(StreamPhase::Aborted);
        Some(Err(io::Error::new(io::ErrorKind::Other, message)))
    }

    async fn stderr_message(&mut self) -> Option<String> {
        let handle = self.stderr.take()?;
        let stderr = tokio::time::timeout(STDERR_GRACE, handle).await.ok()?.ok()?;
        tool_error_message(&stderr)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if !self.phase.finished() {
            tracing::info!(
                url = %self.url,
                bytes = self.bytes_sent,
                phase = %self.phase,
                "client went away, stopping stream"
            );
            self.phase = StreamPhase::Aborted;
        }
    }
}

/// Keep only the tail of stderr; the tool must never block on a full pipe.
fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut tail = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_LIMIT {
                        let excess = tail.len() - STDERR_LIMIT;
                        tail.drain(..excess);
                    }
                }
            }
        }
        tail
    })
}
