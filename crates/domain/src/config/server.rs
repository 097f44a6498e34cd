use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::WireFormat;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for a single stdio tool server.
///
/// Supplied once when the registry is built and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Unique key for this server (the `server` argument of `use_tool`).
    pub name: String,

    /// The executable to spawn (e.g. `"npx"` or an absolute path).
    #[serde(default)]
    pub command: String,

    /// Arguments passed to the command, in order.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the spawned process (inherits ours if unset).
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Upper bound on the readiness handshake.
    #[serde(default = "d_10000")]
    pub startup_timeout_ms: u64,

    /// Timeout applied to calls that do not pass one explicitly.
    #[serde(default = "d_30000")]
    pub default_call_timeout_ms: u64,

    /// Maximum concurrently pending calls (0 = unbounded).
    #[serde(default = "d_50")]
    pub max_in_flight: usize,

    /// How long to wait for a graceful exit before killing the process.
    #[serde(default = "d_5000")]
    pub shutdown_grace_ms: u64,

    /// Largest inbound frame accepted before framing is considered lost.
    #[serde(default = "d_max_frame")]
    pub max_frame_bytes: usize,

    /// Consecutive undecodable frames tolerated before the connection fails.
    #[serde(default = "d_1000")]
    pub max_consecutive_decode_errors: usize,

    /// Lines of child stderr retained for diagnostics.
    #[serde(default = "d_50")]
    pub stderr_tail_lines: usize,

    #[serde(default)]
    pub wire: WireFormat,

    /// Optional readiness exchange performed during start-up.
    #[serde(default)]
    pub handshake: Option<HandshakeConfig>,

    /// Tool called once after start-up to fetch the server's catalog.
    #[serde(default)]
    pub discovery_tool: Option<String>,

    #[serde(default)]
    pub restart: RestartPolicy,
}

impl ToolServerConfig {
    /// Minimal config with every tunable at its default.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            startup_timeout_ms: d_10000(),
            default_call_timeout_ms: d_30000(),
            max_in_flight: d_50(),
            shutdown_grace_ms: d_5000(),
            max_frame_bytes: d_max_frame(),
            max_consecutive_decode_errors: d_1000(),
            stderr_tail_lines: d_50(),
            wire: WireFormat::default(),
            handshake: None,
            discovery_tool: None,
            restart: RestartPolicy::default(),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An explicit readiness exchange.
///
/// The connection calls `tool` with `arguments` and only reports
/// `Running` once it answers successfully within the startup timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeConfig {
    pub tool: String,
    #[serde(default = "d_empty_object")]
    pub arguments: Value,
    /// Id-less notification sent after a successful handshake
    /// (e.g. `"notifications/initialized"`).
    #[serde(default)]
    pub notification: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Restart policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded restart policy applied when a running server crashes.
///
/// `max_attempts = 0` (the default) disables restarts: a crashed
/// connection stays crashed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartPolicy {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "d_500")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_30000")]
    pub max_delay_ms: u64,
    #[serde(default = "d_factor")]
    pub backoff_factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl RestartPolicy {
    pub fn enabled(&self) -> bool {
        self.max_attempts > 0
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_500() -> u64 {
    500
}
fn d_5000() -> u64 {
    5_000
}
fn d_10000() -> u64 {
    10_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_50() -> usize {
    50
}
fn d_1000() -> usize {
    1_000
}
fn d_max_frame() -> usize {
    4 * 1024 * 1024
}
fn d_factor() -> f64 {
    2.0
}
fn d_empty_object() -> Value {
    Value::Object(Default::default())
}
