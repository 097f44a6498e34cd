//! `use_tool`: the entry point calling code consumes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tw_domain::config::{StartPolicy, ToolServersConfig};

use crate::error::ToolCallResult;
use crate::registry::ToolServerRegistry;

/// A serializable call description, for callers that route calls as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    /// Overrides the server's default call timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Cheap-to-clone handle over a shared [`ToolServerRegistry`].
#[derive(Clone)]
pub struct ToolClient {
    registry: Arc<ToolServerRegistry>,
}

impl ToolClient {
    pub fn new(registry: Arc<ToolServerRegistry>) -> Self {
        Self { registry }
    }

    /// Build the registry and, under [`StartPolicy::Eager`], start every
    /// server before returning.
    pub async fn from_config(config: &ToolServersConfig) -> tw_domain::Result<Self> {
        let registry = Arc::new(ToolServerRegistry::new(config)?);
        if registry.start_policy() == StartPolicy::Eager {
            registry.start_all().await;
        }
        Ok(Self::new(registry))
    }

    /// Call `tool` on `server` and wait for its result.
    ///
    /// Starts the server on first use. `timeout` falls back to the
    /// server's `default_call_timeout_ms`. Failures are never retried
    /// here; the error kind says whether retrying makes sense.
    pub async fn use_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> ToolCallResult {
        let conn = self.registry.ensure_started(server).await?;
        let result = conn.call(tool, arguments, timeout).await;
        if let Err(e) = &result {
            tracing::debug!(server, tool, kind = %e.kind, error = %e.message, "tool call failed");
        }
        result
    }

    pub async fn call(&self, call: ToolCall) -> ToolCallResult {
        let timeout = call.timeout_ms.map(Duration::from_millis);
        self.use_tool(&call.server, &call.tool, call.arguments, timeout)
            .await
    }

    pub fn registry(&self) -> &Arc<ToolServerRegistry> {
        &self.registry
    }

    /// Shut every server down; see [`ToolServerRegistry::shutdown_all`].
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}
