//! Child process ownership.
//!
//! A [`ProcessSupervisor`] spawns one tool server, hands its stdout and
//! stderr to the caller, and keeps stdin behind a single-writer queue
//! ([`StdinWriter`]) so frames from concurrent callers are never
//! interleaved. A monitor task owns the `Child` and publishes its exit
//! status; dropping the supervisor kills the process.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use tw_domain::config::ToolServerConfig;

use crate::dispatcher::FrameSink;
use crate::error::{ErrorKind, ToolCallError};

/// Frames queued for stdin before senders start waiting.
const STDIN_QUEUE_DEPTH: usize = 64;

/// Longest stderr line kept in the diagnostic tail.
const MAX_STDERR_LINE_CHARS: usize = 2_048;

/// Bytes read per stderr line before the remainder is dropped.
const MAX_STDERR_LINE_BYTES: usize = MAX_STDERR_LINE_CHARS * 4;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exit info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How and when a child process ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Human-readable status (`"exit status: 1"`, `"signal: 9 (SIGKILL)"`, ...).
    pub description: String,
    pub at: DateTime<Utc>,
}

impl ExitInfo {
    fn from_wait(result: io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self {
                code: status.code(),
                description: status.to_string(),
                at: Utc::now(),
            },
            Err(e) => Self {
                code: None,
                description: format!("wait failed: {e}"),
                at: Utc::now(),
            },
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            description: "exit status unavailable".into(),
            at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdin writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single-writer queue in front of the child's stdin.
///
/// Frames are written whole by one task, so a caller that gives up while
/// its frame is queued can never leave half a frame on the pipe.
pub struct StdinWriter {
    server: String,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl StdinWriter {
    fn spawn(server: &str, stdin: ChildStdin) -> Self {
        let (tx, rx) = mpsc::channel(STDIN_QUEUE_DEPTH);
        tokio::spawn(write_loop(server.to_string(), stdin, rx));
        Self {
            server: server.to_string(),
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Stop accepting frames. Queued frames are still flushed, then stdin
    /// is closed, which is the child's cue to exit.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            tracing::debug!(server = %self.server, "closing tool server stdin");
        }
    }
}

#[async_trait]
impl FrameSink for StdinWriter {
    async fn send_frame(&self, frame: Vec<u8>) -> io::Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        tx.send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stdin writer has stopped"))
    }
}

async fn write_loop(server: String, mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        let written = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(server = %server, error = %e, "failed writing to tool server stdin");
            return;
        }
    }
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(server = %server, error = %e, "error closing tool server stdin");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The child's output streams, for the connection's reader tasks.
pub struct ChildOutput {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Owns exactly one tool server process.
pub struct ProcessSupervisor {
    server: String,
    pid: Option<u32>,
    writer: Arc<StdinWriter>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessSupervisor {
    /// Spawn the configured command with piped stdio.
    ///
    /// Returns as soon as the process exists; readiness is the
    /// connection's business.
    pub fn spawn(config: &ToolServerConfig) -> Result<(Self, ChildOutput), ToolCallError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            let why = if e.kind() == io::ErrorKind::NotFound {
                "executable not found".to_string()
            } else {
                e.to_string()
            };
            ToolCallError::new(
                ErrorKind::ProcessLaunch,
                format!("failed to spawn '{}' for '{}': {why}", config.command, config.name),
            )
        })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(ToolCallError::new(
                    ErrorKind::ProcessLaunch,
                    format!("failed to capture stdio for '{}'", config.name),
                ));
            }
        };

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor(config.name.clone(), child, kill_rx, exit_tx));

        tracing::debug!(server = %config.name, pid, command = %config.command, "spawned tool server");

        let supervisor = Self {
            server: config.name.clone(),
            pid,
            writer: Arc::new(StdinWriter::spawn(&config.name, stdin)),
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
        };
        Ok((supervisor, ChildOutput { stdout, stderr }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn writer(&self) -> Arc<StdinWriter> {
        self.writer.clone()
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    /// Resolves once the process has exited.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let info = match rx.wait_for(Option::is_some).await {
            Ok(info) => info.clone(),
            Err(_) => None,
        };
        info.unwrap_or_else(ExitInfo::unknown)
    }

    /// Close stdin, wait up to `grace` for the process to exit, then kill
    /// it. Terminating an exited process just returns its exit info.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        if let Some(info) = self.exit_info() {
            return info;
        }

        self.writer.close();
        match tokio::time::timeout(grace, self.wait_exit()).await {
            Ok(info) => {
                tracing::debug!(server = %self.server, status = %info.description, "tool server exited");
                info
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.server,
                    grace_ms = grace.as_millis() as u64,
                    "tool server did not exit within grace window, killing"
                );
                self.kill();
                self.wait_exit().await
            }
        }
    }

    fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// Owns the `Child`: waits for it to exit, or kills it when asked (or when
/// the supervisor is dropped and the kill sender goes with it).
async fn monitor(
    server: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let result = tokio::select! {
        result = child.wait() => result,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(server = %server, error = %e, "failed to kill tool server");
            }
            child.wait().await
        }
    };
    let info = ExitInfo::from_wait(result);
    tracing::debug!(server = %server, status = %info.description, "tool server process ended");
    exit_tx.send_replace(Some(info));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stderr
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded tail of a server's stderr, kept for diagnostics.
pub struct StderrTail {
    cap: usize,
    lines: Mutex<VecDeque<String>>,
}

impl StderrTail {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            lines: Mutex::new(VecDeque::with_capacity(cap)),
        }
    }

    pub fn push(&self, mut line: String) {
        if self.cap == 0 {
            return;
        }
        if let Some((idx, _)) = line.char_indices().nth(MAX_STDERR_LINE_CHARS) {
            line.truncate(idx);
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.cap {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<String> {
        self.lines.lock().back().cloned()
    }
}

/// Drain stderr line by line into the log and the tail. Stderr is never
/// parsed as protocol data.
pub fn spawn_stderr_drain(
    server: String,
    stderr: ChildStderr,
    tail: Arc<StderrTail>,
) -> JoinHandle<()> {
    tokio::spawn(drain_stderr(server, stderr, tail))
}

/// Reads at most [`MAX_STDERR_LINE_BYTES`] per line; the rest of an
/// overlong line is discarded up to its newline.
async fn drain_stderr<R: AsyncRead + Unpin>(server: String, stderr: R, tail: Arc<StderrTail>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut skipping = false;
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_STDERR_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                if std::mem::replace(&mut skipping, !complete) {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(server = %server, line = %line, "tool server stderr");
                tail.push(line);
            }
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "stopped reading tool server stderr");
                break;
            }
        }
    }
}
