//! One connection per configured tool server.
//!
//! A [`ServerConnection`] composes a [`ProcessSupervisor`], a [`Codec`] and
//! a [`Dispatcher`]. Each started process gets a *session*: a reader task
//! draining stdout into the dispatcher (the only caller of
//! [`Dispatcher::on_message`]), a stderr drain, and a watcher that turns an
//! unexpected exit into a crash, failing pending calls and optionally
//! restarting the process.
//!
//! State machine:
//!
//! ```text
//! NotStarted → Starting → Running → Stopping → Stopped
//!                  │          │
//!                  │          └──→ Crashed ──(restart policy)──→ Starting
//!                  └──→ Failed ←── (startup failure, framing lost, budget exhausted)
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tw_domain::config::{HandshakeConfig, ToolServerConfig};

use crate::backoff::RestartBackoff;
use crate::codec::{Codec, FrameDecoder};
use crate::dispatcher::{Dispatcher, FrameSink};
use crate::error::{ErrorKind, ToolCallError, ToolCallResult};
use crate::process::{spawn_stderr_drain, ExitInfo, ProcessSupervisor, StderrTail, StdinWriter};

/// Bytes requested per stdout read.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How long the reader may keep draining stdout after the process exits.
const READER_DRAIN: Duration = Duration::from_secs(1);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Failed,
}

impl ConnectionState {
    /// No further calls will ever be accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Stopped | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::NotStarted => "not started",
            ConnectionState::Starting => "starting",
            ConnectionState::Running => "running",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Stopped => "stopped",
            ConnectionState::Crashed => "crashed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub name: String,
    pub state: ConnectionState,
    pub pid: Option<u32>,
    pub alive: bool,
    pub in_flight: usize,
    pub orphans: u64,
    /// Successful automatic restarts.
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitInfo>,
    pub last_error: Option<String>,
    pub stderr_tail: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The live process of a connection, owned under the lifecycle lock.
struct Session {
    generation: u64,
    supervisor: Arc<ProcessSupervisor>,
}

#[derive(Default)]
struct Runtime {
    started_at: Option<DateTime<Utc>>,
    last_exit: Option<ExitInfo>,
    last_error: Option<ToolCallError>,
    restarts: u32,
}

/// Why a session's reader stopped.
#[derive(Debug)]
enum ReaderExit {
    Eof,
    Io(String),
    FramingLost(String),
}

pub struct ServerConnection {
    config: Arc<ToolServerConfig>,
    codec: Arc<Codec>,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<ConnectionState>,
    /// Serializes start, stop and restart.
    lifecycle: Mutex<Option<Session>>,
    /// Lock-free view of the current process for the call path.
    process: RwLock<Option<Arc<ProcessSupervisor>>>,
    runtime: RwLock<Runtime>,
    /// Bumped on every launch; watchers of older sessions stand down.
    generation: AtomicU64,
    /// Consecutive restart attempts since the last healthy exchange.
    restart_attempts: AtomicU32,
    stderr_tail: Arc<StderrTail>,
    catalog: RwLock<Option<Value>>,
    /// Cancelled by `stop`; never reset.
    closing: CancellationToken,
    this: Weak<Self>,
}

impl ServerConnection {
    pub fn new(config: ToolServerConfig) -> Arc<Self> {
        let codec = Arc::new(Codec::new(config.wire.clone(), config.max_frame_bytes));
        let dispatcher = Arc::new(Dispatcher::new(
            config.name.clone(),
            codec.clone(),
            config.max_in_flight,
        ));
        let (state, _) = watch::channel(ConnectionState::NotStarted);
        let stderr_tail = Arc::new(StderrTail::new(config.stderr_tail_lines));

        Arc::new_cyclic(|this| Self {
            config: Arc::new(config),
            codec,
            dispatcher,
            state,
            lifecycle: Mutex::new(None),
            process: RwLock::new(None),
            runtime: RwLock::new(Runtime::default()),
            generation: AtomicU64::new(0),
            restart_attempts: AtomicU32::new(0),
            stderr_tail,
            catalog: RwLock::new(None),
            closing: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The discovery tool's result, if one is configured and succeeded.
    pub fn catalog(&self) -> Option<Value> {
        self.catalog.read().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.state();
        let process = self.process.read().clone();
        let rt = self.runtime.read();
        ConnectionStatus {
            name: self.config.name.clone(),
            state,
            pid: process.as_ref().and_then(|p| p.pid()),
            alive: process.as_ref().is_some_and(|p| p.is_alive()),
            in_flight: self.dispatcher.in_flight(),
            orphans: self.dispatcher.orphan_count(),
            restarts: rt.restarts,
            started_at: rt.started_at,
            last_exit: rt.last_exit.clone(),
            last_error: rt.last_error.as_ref().map(|e| e.to_string()),
            stderr_tail: self.stderr_tail.snapshot(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Spawn the process and wait for readiness.
    ///
    /// Starting a running connection is a no-op. A crashed connection may
    /// be started again by hand; stopped and failed ones may not.
    pub async fn start(&self) -> Result<(), ToolCallError> {
        self.run_start(false).await
    }

    /// Start the connection if it has never been started. Any other state
    /// is left for [`call`](Self::call) to judge.
    pub async fn ensure_started(&self) -> Result<(), ToolCallError> {
        if self.state() != ConnectionState::NotStarted {
            return Ok(());
        }
        self.run_start(true).await
    }

    /// Launch on a separate task so a caller that gives up mid-handshake
    /// cannot leave the connection half started.
    async fn run_start(&self, only_fresh: bool) -> Result<(), ToolCallError> {
        let Some(this) = self.this.upgrade() else {
            return Err(self.unavailable(self.state()));
        };
        let task = tokio::spawn(async move {
            let mut slot = this.lifecycle.lock().await;
            match this.state() {
                ConnectionState::Running => Ok(()),
                ConnectionState::NotStarted => this.launch(&mut slot).await,
                ConnectionState::Crashed if !only_fresh => this.launch(&mut slot).await,
                _ if only_fresh => Ok(()),
                other => Err(this.unavailable(other)),
            }
        });
        task.await.unwrap_or_else(|e| {
            Err(ToolCallError::new(
                ErrorKind::ProcessLaunch,
                format!("start task for '{}' failed: {e}", self.config.name),
            ))
        })
    }

    /// Stop the connection for good: cancel pending calls, close stdin,
    /// and kill the process if it outlives the grace window.
    pub async fn stop(&self) {
        let cancelled = ToolCallError::new(
            ErrorKind::Cancelled,
            format!("connection to '{}' stopped", self.config.name),
        );
        self.closing.cancel();
        self.dispatcher.close(cancelled.clone());

        let mut slot = self.lifecycle.lock().await;
        // A launch that passed its `closing` check before we cancelled may
        // have reopened the dispatcher; no launch can run past this point.
        self.dispatcher.close(cancelled);
        let prev = self.state();
        if prev == ConnectionState::Stopped {
            return;
        }
        self.state.send_replace(ConnectionState::Stopping);
        *self.process.write() = None;

        if let Some(session) = slot.take() {
            let exit = session.supervisor.terminate(self.config.shutdown_grace()).await;
            self.runtime.write().last_exit = Some(exit);
        }

        let final_state = if prev == ConnectionState::Failed {
            ConnectionState::Failed
        } else {
            ConnectionState::Stopped
        };
        self.state.send_replace(final_state);
        tracing::info!(server = %self.config.name, "tool server stopped");
    }

    async fn launch(&self, slot: &mut Option<Session>) -> Result<(), ToolCallError> {
        if self.closing.is_cancelled() {
            return Err(self.unavailable(ConnectionState::Stopped));
        }
        let name = self.config.name.clone();
        self.state.send_replace(ConnectionState::Starting);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // Reopen before the watcher exists so an instant crash still closes it.
        self.dispatcher.reopen();

        tracing::info!(
            server = %name,
            command = %self.config.command,
            generation,
            "starting tool server"
        );

        let (supervisor, output) = match ProcessSupervisor::spawn(&self.config) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.mark_failed(err.clone());
                return Err(err);
            }
        };
        let supervisor = Arc::new(supervisor);
        let writer = supervisor.writer();

        let stderr_drain = spawn_stderr_drain(name.clone(), output.stderr, self.stderr_tail.clone());
        let reader = tokio::spawn(read_loop(
            name.clone(),
            output.stdout,
            self.codec.clone(),
            self.dispatcher.clone(),
            self.config.max_consecutive_decode_errors,
        ));
        tokio::spawn(watch_session(
            self.this.clone(),
            generation,
            supervisor.clone(),
            reader,
            stderr_drain,
        ));

        {
            let mut rt = self.runtime.write();
            rt.started_at = Some(Utc::now());
            rt.last_error = None;
        }
        *self.process.write() = Some(supervisor.clone());
        *slot = Some(Session {
            generation,
            supervisor: supervisor.clone(),
        });

        if let Some(handshake) = &self.config.handshake {
            if let Err(err) = self.handshake(&writer, handshake).await {
                self.teardown(slot, err.clone()).await;
                return Err(err);
            }
        }

        // The watcher may have flagged a crash while we were starting.
        let promoted = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Starting {
                *s = ConnectionState::Running;
                true
            } else {
                false
            }
        });
        if !promoted {
            let err = ToolCallError::new(
                ErrorKind::ServerCrashed,
                format!("tool server '{name}' exited during startup"),
            );
            self.teardown(slot, err.clone()).await;
            return Err(err);
        }

        tracing::info!(server = %name, pid = ?supervisor.pid(), "tool server running");

        if let Some(tool) = &self.config.discovery_tool {
            self.discover(&writer, tool).await;
        }
        Ok(())
    }

    async fn handshake(
        &self,
        writer: &StdinWriter,
        handshake: &HandshakeConfig,
    ) -> Result<(), ToolCallError> {
        let timeout = self.config.startup_timeout();
        let result = tokio::select! {
            r = self.dispatcher.dispatch(writer, &handshake.tool, handshake.arguments.clone(), timeout) => r,
            _ = self.closing.cancelled() => Err(ToolCallError::new(
                ErrorKind::Cancelled,
                "connection stopped during startup",
            )),
        };

        if let Err(e) = result {
            return Err(match e.kind {
                ErrorKind::Timeout => ToolCallError::new(
                    ErrorKind::StartupTimeout,
                    format!(
                        "'{}' did not answer {} within {}ms",
                        self.config.name, handshake.tool, self.config.startup_timeout_ms
                    ),
                ),
                ErrorKind::ToolExecution => ToolCallError::new(
                    ErrorKind::ProcessLaunch,
                    format!("'{}' rejected the handshake: {}", self.config.name, e.message),
                ),
                _ => e,
            });
        }

        if let Some(notification) = &handshake.notification {
            let sent = match self.codec.encode_notification(notification) {
                Ok(frame) => writer.send_frame(frame).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = sent {
                tracing::warn!(
                    server = %self.config.name,
                    notification = %notification,
                    error = %e,
                    "failed to send handshake notification"
                );
            }
        }

        tracing::debug!(server = %self.config.name, tool = %handshake.tool, "handshake complete");
        Ok(())
    }

    async fn discover(&self, writer: &StdinWriter, tool: &str) {
        let args = Value::Object(Default::default());
        match self
            .dispatcher
            .dispatch(writer, tool, args, self.config.startup_timeout())
            .await
        {
            Ok(catalog) => {
                tracing::info!(server = %self.config.name, tool, "tool catalog discovered");
                *self.catalog.write() = Some(catalog);
            }
            Err(e) => {
                tracing::warn!(
                    server = %self.config.name,
                    tool,
                    error = %e,
                    "tool discovery failed, catalog left empty"
                );
            }
        }
    }

    /// Record a startup failure that left no process behind.
    fn mark_failed(&self, err: ToolCallError) {
        self.state.send_replace(ConnectionState::Failed);
        self.dispatcher.close(err.clone());
        self.runtime.write().last_error = Some(err);
    }

    /// Take a half-started session down and leave the connection failed.
    async fn teardown(&self, slot: &mut Option<Session>, err: ToolCallError) {
        self.mark_failed(err);
        *self.process.write() = None;
        if let Some(session) = slot.take() {
            let exit = session.supervisor.terminate(self.config.shutdown_grace()).await;
            self.runtime.write().last_exit = Some(exit);
        }
    }

    // ── Crash handling ──────────────────────────────────────────────

    async fn on_session_end(
        &self,
        generation: u64,
        supervisor: &ProcessSupervisor,
        reader_exit: ReaderExit,
    ) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let next = match reader_exit {
            ReaderExit::FramingLost(_) => ConnectionState::Failed,
            ReaderExit::Eof | ReaderExit::Io(_) => ConnectionState::Crashed,
        };
        // Only an unplanned end of a live session counts.
        let flagged = self.state.send_if_modified(|s| {
            if matches!(*s, ConnectionState::Running | ConnectionState::Starting) {
                *s = next;
                true
            } else {
                false
            }
        });
        if !flagged {
            return;
        }
        if let Some(exit) = supervisor.exit_info() {
            self.runtime.write().last_exit = Some(exit);
        }

        let name = &self.config.name;
        let err = match &reader_exit {
            ReaderExit::FramingLost(why) => ToolCallError::new(
                ErrorKind::ProtocolDecode,
                format!("lost framing with '{name}': {why}"),
            ),
            ReaderExit::Eof | ReaderExit::Io(_) => {
                let how = match supervisor.exit_info() {
                    Some(exit) => exit.description,
                    None => match &reader_exit {
                        ReaderExit::Io(e) => format!("stdout read failed: {e}"),
                        _ => "stdout closed".into(),
                    },
                };
                let mut message = format!("tool server '{name}' exited unexpectedly ({how})");
                if let Some(line) = self.stderr_tail.last() {
                    message.push_str(&format!("; last stderr: {line}"));
                }
                ToolCallError::new(ErrorKind::ServerCrashed, message)
            }
        };

        self.dispatcher.close(err.clone());
        tracing::warn!(server = %name, state = %next, error = %err.message, "tool server connection lost");

        let exit = supervisor.terminate(self.config.shutdown_grace()).await;

        let mut slot = self.lifecycle.lock().await;
        if slot.as_ref().map(|s| s.generation) != Some(generation) {
            // Stopped or relaunched while we waited.
            return;
        }
        *slot = None;
        *self.process.write() = None;
        {
            let mut rt = self.runtime.write();
            rt.last_exit = Some(exit);
            rt.last_error = Some(err);
        }

        if next == ConnectionState::Crashed && self.config.restart.enabled() {
            self.restart(&mut slot).await;
        }
    }

    /// Boxed: a restart launches a session whose watcher may restart again.
    fn restart<'a>(
        &'a self,
        slot: &'a mut Option<Session>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let name = &self.config.name;
            let backoff = RestartBackoff::from(&self.config.restart);
            loop {
                let attempt = self.restart_attempts.fetch_add(1, Ordering::SeqCst);
                if backoff.should_give_up(attempt) {
                    tracing::error!(server = %name, attempts = attempt, "restart budget exhausted");
                    self.mark_failed(ToolCallError::unavailable(
                        name,
                        format!("failed after {attempt} restart attempts"),
                    ));
                    return;
                }

                let delay = backoff.delay_for_attempt(attempt);
                tracing::info!(
                    server = %name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "restarting tool server"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.closing.cancelled() => return,
                }

                match self.launch(slot).await {
                    Ok(()) => {
                        self.runtime.write().restarts += 1;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(server = %name, error = %e, "restart attempt failed");
                        self.state.send_replace(ConnectionState::Crashed);
                    }
                }
            }
        })
    }

    // ── Calls ───────────────────────────────────────────────────────

    /// Call `tool` on this server. Fails fast unless the connection is
    /// running.
    pub async fn call(&self, tool: &str, arguments: Value, timeout: Option<Duration>) -> ToolCallResult {
        let state = self.state();
        if state != ConnectionState::Running {
            return Err(self.unavailable(state));
        }
        let Some(process) = self.process.read().clone() else {
            return Err(self.unavailable(state));
        };

        let timeout = timeout.unwrap_or_else(|| self.config.default_call_timeout());
        let writer = process.writer();
        let result = self
            .dispatcher
            .dispatch(writer.as_ref(), tool, arguments, timeout)
            .await;

        let healthy = match &result {
            Ok(_) => true,
            Err(e) => e.kind == ErrorKind::ToolExecution,
        };
        if healthy {
            self.restart_attempts.store(0, Ordering::SeqCst);
        }
        result
    }

    fn unavailable(&self, state: ConnectionState) -> ToolCallError {
        match &self.runtime.read().last_error {
            Some(cause) => ToolCallError::unavailable(&self.config.name, format!("{state} ({cause})")),
            None => ToolCallError::unavailable(&self.config.name, state),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drain stdout into the dispatcher until EOF or framing is lost.
async fn read_loop(
    server: String,
    mut stdout: ChildStdout,
    codec: Arc<Codec>,
    dispatcher: Arc<Dispatcher>,
    max_decode_errors: usize,
) -> ReaderExit {
    let mut decoder = FrameDecoder::new(codec);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut consecutive_errors = 0usize;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => {
                if decoder.buffered() > 0 {
                    tracing::debug!(server = %server, bytes = decoder.buffered(), "unterminated frame at EOF");
                }
                return ReaderExit::Eof;
            }
            Ok(n) => n,
            Err(e) => return ReaderExit::Io(e.to_string()),
        };

        for decoded in decoder.push(&buf[..n]) {
            match decoded {
                Ok(message) => {
                    consecutive_errors = 0;
                    dispatcher.on_message(message);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(server = %server, error = %e, "dropping undecodable frame");
                    if max_decode_errors > 0 && consecutive_errors >= max_decode_errors {
                        return ReaderExit::FramingLost(format!(
                            "{consecutive_errors} consecutive undecodable frames"
                        ));
                    }
                }
            }
        }

        if let Err(e) = decoder.check_overflow() {
            return ReaderExit::FramingLost(e.to_string());
        }
    }
}

/// Wait for the session to end, then hand over to the connection.
async fn watch_session(
    conn: Weak<ServerConnection>,
    generation: u64,
    supervisor: Arc<ProcessSupervisor>,
    mut reader: JoinHandle<ReaderExit>,
    stderr_drain: JoinHandle<()>,
) {
    let reader_exit = tokio::select! {
        r = &mut reader => r.unwrap_or_else(|e| ReaderExit::Io(e.to_string())),
        _ = supervisor.wait_exit() => {
            // Responses written just before exit may still be in the pipe.
            match tokio::time::timeout(READER_DRAIN, &mut reader).await {
                Ok(r) => r.unwrap_or_else(|e| ReaderExit::Io(e.to_string())),
                Err(_) => {
                    reader.abort();
                    ReaderExit::Eof
                }
            }
        }
    };

    // A closed stdout usually means the process is on its way out. Let its
    // exit status and last stderr lines land before reporting.
    if !matches!(reader_exit, ReaderExit::FramingLost(_)) {
        let _ = tokio::time::timeout(READER_DRAIN, supervisor.wait_exit()).await;
        let _ = tokio::time::timeout(READER_DRAIN, stderr_drain).await;
    }

    if let Some(conn) = conn.upgrade() {
        conn.on_session_end(generation, &supervisor, reader_exit).await;
    }
}
