//! `tw-client`: stdio tool-invocation client for toolwire.
//!
//! This crate provides:
//! - A newline-delimited JSON codec with configurable field names.
//! - A process supervisor that spawns tool servers and owns their stdio.
//! - A request dispatcher correlating concurrent calls with out-of-order
//!   responses, with per-call deadlines and an in-flight cap.
//! - Server connections with a lifecycle state machine, crash detection
//!   and an optional bounded restart policy.
//! - A `ToolServerRegistry` holding every connection, and `ToolClient::use_tool`,
//!   the entry point calling code uses.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tw_client::{ToolClient, ToolServersConfig};
//!
//! let config = ToolServersConfig::load("tools.toml")?;
//! let client = ToolClient::from_config(&config).await?;
//!
//! let result = client
//!     .use_tool("filesystem", "read_file", json!({"path": "/tmp/test.txt"}), None)
//!     .await?;
//!
//! client.shutdown().await;
//! ```

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod process;
pub mod registry;

// Re-exports for convenience.
pub use client::{ToolCall, ToolClient};
pub use config::{ToolServerConfig, ToolServersConfig};
pub use connection::{ConnectionState, ConnectionStatus, ServerConnection};
pub use error::{ErrorKind, RemoteError, ToolCallError, ToolCallResult};
pub use registry::ToolServerRegistry;
