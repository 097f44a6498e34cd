//! Request dispatcher: correlates calls with responses.
//!
//! Every call gets a fresh id and a [`PendingCall`] holding a oneshot
//! sender. Whoever removes the entry from the pending table owns its
//! resolution: the reader (response arrived), the caller (deadline
//! elapsed, write failed, or the future was dropped), or a teardown
//! (`fail_all` / `close`). Removal happens under one lock, so each call
//! resolves exactly once.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::{Codec, Inbound};
use crate::error::{ErrorKind, ToolCallError, ToolCallResult};

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Where encoded frames go. Implementations must write each frame whole.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: Vec<u8>) -> io::Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending call tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingCall {
    tool: String,
    deadline: Instant,
    tx: oneshot::Sender<ToolCallResult>,
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, PendingCall>,
    /// Set while the dispatcher refuses new calls.
    closed: Option<ToolCallError>,
}

/// A pending call as reported by [`Dispatcher::pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: u64,
    pub tool: String,
    pub remaining: Duration,
}

/// Removes a call's pending entry if its future is dropped before it
/// resolves, so cancellation only ever affects that one caller.
struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.dispatcher.take(self.id).is_some() {
            tracing::debug!(
                server = %self.dispatcher.server,
                id = self.id,
                "caller abandoned pending call"
            );
        }
    }
}

enum Waited {
    Write(io::Error),
    Dropped,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Dispatcher {
    server: String,
    codec: Arc<Codec>,
    table: Mutex<PendingTable>,
    /// Ids are never reused for the lifetime of the dispatcher, across
    /// process restarts included.
    next_id: AtomicU64,
    /// Maximum pending calls (0 = unlimited).
    max_in_flight: usize,
    orphans: AtomicU64,
}

impl Dispatcher {
    pub fn new(server: impl Into<String>, codec: Arc<Codec>, max_in_flight: usize) -> Self {
        Self {
            server: server.into(),
            codec,
            table: Mutex::new(PendingTable::default()),
            next_id: AtomicU64::new(1),
            max_in_flight,
            orphans: AtomicU64::new(0),
        }
    }

    /// Send one call through `sink` and wait for its result.
    ///
    /// The deadline covers queuing the frame as well as waiting for the
    /// response.
    pub async fn dispatch(
        &self,
        sink: &dyn FrameSink,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> ToolCallResult {
        let deadline = deadline_after(timeout);

        // ── Register ───────────────────────────────────────────────
        let (id, mut rx) = {
            let mut table = self.table.lock();
            if let Some(err) = &table.closed {
                return Err(err.clone());
            }
            if self.max_in_flight > 0 && table.calls.len() >= self.max_in_flight {
                return Err(ToolCallError::new(
                    ErrorKind::Overloaded,
                    format!(
                        "tool server '{}' has {} calls in flight (limit {})",
                        self.server,
                        table.calls.len(),
                        self.max_in_flight
                    ),
                ));
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            let prev = table.calls.insert(
                id,
                PendingCall {
                    tool: tool.to_string(),
                    deadline,
                    tx,
                },
            );
            debug_assert!(prev.is_none(), "correlation id reused: {id}");
            (id, rx)
        };
        let _guard = PendingGuard { dispatcher: self, id };

        let frame = match self.codec.encode(id, tool, &arguments) {
            Ok(frame) => frame,
            Err(e) => {
                return self.settle(
                    id,
                    &mut rx,
                    ToolCallError::new(
                        ErrorKind::InvalidRequest,
                        format!("failed to encode call to {tool}: {e}"),
                    ),
                );
            }
        };

        tracing::debug!(server = %self.server, id, tool, "dispatching tool call");

        // ── Write, then wait ───────────────────────────────────────
        let waited = tokio::time::timeout_at(deadline, async {
            sink.send_frame(frame).await.map_err(Waited::Write)?;
            (&mut rx).await.map_err(|_| Waited::Dropped)
        })
        .await;

        match waited {
            Ok(Ok(result)) => result,
            Ok(Err(Waited::Write(e))) => self.settle(
                id,
                &mut rx,
                ToolCallError::new(
                    ErrorKind::ServerCrashed,
                    format!("failed to send {tool} to '{}': {e}", self.server),
                ),
            ),
            Ok(Err(Waited::Dropped)) => Err(ToolCallError::new(
                ErrorKind::Cancelled,
                format!("call to {tool} on '{}' was dropped unresolved", self.server),
            )),
            Err(_) => {
                let err = ToolCallError::new(
                    ErrorKind::Timeout,
                    format!(
                        "{tool} on '{}' timed out after {}ms",
                        self.server,
                        timeout.as_millis()
                    ),
                );
                let result = self.settle(id, &mut rx, err);
                if matches!(&result, Err(e) if e.kind == ErrorKind::Timeout) {
                    tracing::warn!(server = %self.server, id, tool, "tool call timed out");
                }
                result
            }
        }
    }

    /// Resolve call `id` locally with `err`, unless someone else already
    /// removed it, in which case their outcome is already in `rx`.
    fn settle(
        &self,
        id: u64,
        rx: &mut oneshot::Receiver<ToolCallResult>,
        err: ToolCallError,
    ) -> ToolCallResult {
        if self.take(id).is_some() {
            return Err(err);
        }
        match rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(err),
        }
    }

    fn take(&self, id: u64) -> Option<PendingCall> {
        self.table.lock().calls.remove(&id)
    }

    /// Route one inbound message. Called only by the connection's reader.
    pub fn on_message(&self, message: Inbound) {
        match message {
            Inbound::Response { id, outcome } => {
                let result = outcome.map_err(ToolCallError::from);
                if !self.resolve(id, result) {
                    self.orphans.fetch_add(1, Ordering::Relaxed);
                    let late = id > 0 && id < self.next_id.load(Ordering::Relaxed);
                    tracing::warn!(
                        server = %self.server,
                        id,
                        late,
                        "discarding response with no pending call"
                    );
                }
            }
            Inbound::Notification(value) => {
                tracing::debug!(server = %self.server, notification = %value, "tool server notification");
            }
        }
    }

    /// Fill call `id`'s result slot. Returns `false` if no such call is
    /// pending.
    pub fn resolve(&self, id: u64, result: ToolCallResult) -> bool {
        match self.take(id) {
            Some(call) => {
                tracing::debug!(
                    server = %self.server,
                    id,
                    tool = %call.tool,
                    ok = result.is_ok(),
                    "tool call resolved"
                );
                // The caller may have been dropped; that is its business.
                let _ = call.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Resolve every pending call with `err`. Returns how many were failed.
    pub fn fail_all(&self, err: ToolCallError) -> usize {
        let drained: Vec<_> = self.table.lock().calls.drain().collect();
        let count = drained.len();
        for (_, call) in drained {
            let _ = call.tx.send(Err(err.clone()));
        }
        if count > 0 {
            tracing::warn!(
                server = %self.server,
                failed = count,
                kind = %err.kind,
                "failed in-flight tool calls"
            );
        }
        count
    }

    /// Refuse new calls with `err` and fail the pending ones with it.
    pub fn close(&self, err: ToolCallError) -> usize {
        self.table.lock().closed = Some(err.clone());
        self.fail_all(err)
    }

    /// Accept calls again (after a restart).
    pub fn reopen(&self) {
        self.table.lock().closed = None;
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed.is_some()
    }

    /// Number of pending (in-flight) calls.
    pub fn in_flight(&self) -> usize {
        self.table.lock().calls.len()
    }

    /// Responses discarded because no call was waiting for them.
    pub fn orphan_count(&self) -> u64 {
        self.orphans.load(Ordering::Relaxed)
    }

    /// Snapshot of pending calls, oldest id first.
    pub fn pending(&self) -> Vec<PendingInfo> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .table
            .lock()
            .calls
            .iter()
            .map(|(&id, call)| PendingInfo {
                id,
                tool: call.tool.clone(),
                remaining: call.deadline.saturating_duration_since(now),
            })
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }
}

/// `now + timeout`, saturating to [`FAR_FUTURE`] so `Duration::MAX` means
/// "no deadline" instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
