//! Error taxonomy for tool calls.
//!
//! Every failure that can come out of `use_tool` is a [`ToolCallError`]
//! tagged with an [`ErrorKind`]; nothing escapes as a panic or an untyped
//! error.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The executable could not be spawned, or rejected the handshake.
    ProcessLaunch,
    /// The readiness handshake did not complete within the startup timeout.
    StartupTimeout,
    /// Inbound bytes could not be decoded, or framing was lost.
    ProtocolDecode,
    /// No server with that name is configured.
    UnknownServer,
    /// The connection is not running.
    ServerUnavailable,
    /// The connection's in-flight cap was reached.
    Overloaded,
    /// The deadline elapsed with no response.
    Timeout,
    /// The tool server answered with a structured error.
    ToolExecution,
    /// The process exited while the call was pending.
    ServerCrashed,
    /// The registry is shutting down.
    DispatcherClosed,
    /// The connection was torn down while the call was pending.
    Cancelled,
    /// The request could not be encoded.
    InvalidRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ProcessLaunch => "process launch error",
            ErrorKind::StartupTimeout => "startup timeout",
            ErrorKind::ProtocolDecode => "protocol decode error",
            ErrorKind::UnknownServer => "unknown server",
            ErrorKind::ServerUnavailable => "server unavailable",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ToolExecution => "tool execution error",
            ErrorKind::ServerCrashed => "server crashed",
            ErrorKind::DispatcherClosed => "dispatcher closed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid request",
        };
        f.write_str(s)
    }
}

/// The structured error a tool server reported for one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteError {
    /// The server's own error kind (numeric codes are kept as strings).
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A failed tool call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ToolCallError {
    pub kind: ErrorKind,
    pub message: String,
    /// Present only for [`ErrorKind::ToolExecution`].
    pub remote: Option<RemoteError>,
}

impl ToolCallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remote: None,
        }
    }

    pub fn unavailable(server: &str, why: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ServerUnavailable,
            format!("tool server '{server}' is {why}"),
        )
    }
}

impl From<RemoteError> for ToolCallError {
    fn from(remote: RemoteError) -> Self {
        Self {
            kind: ErrorKind::ToolExecution,
            message: remote.message.clone(),
            remote: Some(remote),
        }
    }
}

/// Outcome of a single call: the tool's opaque payload, or a typed failure.
pub type ToolCallResult = Result<Value, ToolCallError>;
