//! Connection registry: the one object an application holds to reach its
//! tool servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use tw_domain::config::{ConfigSeverity, StartPolicy, ToolServersConfig};

use crate::connection::{ConnectionState, ConnectionStatus, ServerConnection};
use crate::error::{ErrorKind, ToolCallError};

/// Maps server names to their connections.
pub struct ToolServerRegistry {
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
    start_policy: StartPolicy,
    closed: AtomicBool,
}

impl ToolServerRegistry {
    /// Build one (not yet started) connection per configured server.
    ///
    /// Configs with error-severity issues are rejected; warnings are
    /// logged.
    pub fn new(config: &ToolServersConfig) -> tw_domain::Result<Self> {
        config.validate_strict()?;
        for issue in config.validate() {
            if issue.severity == ConfigSeverity::Warning {
                tracing::warn!(field = %issue.field, "{}", issue.message);
            }
        }

        let connections = config
            .servers
            .iter()
            .map(|server| (server.name.clone(), ServerConnection::new(server.clone())))
            .collect();

        Ok(Self {
            connections: RwLock::new(connections),
            start_policy: config.start_policy,
            closed: AtomicBool::new(false),
        })
    }

    /// A registry with no servers.
    pub fn empty() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            start_policy: StartPolicy::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn start_policy(&self) -> StartPolicy {
        self.start_policy
    }

    /// Start every connection concurrently.
    ///
    /// Servers that fail to start are logged and skipped (not fatal); they
    /// stay `Failed` and their calls fail fast. Returns how many are
    /// running.
    pub async fn start_all(&self) -> usize {
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        let futs = connections.iter().map(|conn| async move {
            if let Err(e) = conn.ensure_started().await {
                tracing::warn!(
                    server = %conn.name(),
                    error = %e,
                    "failed to start tool server, skipping"
                );
            }
        });
        futures_util::future::join_all(futs).await;

        let running = connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Running)
            .count();
        tracing::info!(running, configured = connections.len(), "tool servers started");
        running
    }

    /// Look up a connection without starting it.
    pub fn get(&self, name: &str) -> Result<Arc<ServerConnection>, ToolCallError> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.connections.read().get(name).cloned().ok_or_else(|| {
            ToolCallError::new(
                ErrorKind::UnknownServer,
                format!("no tool server named '{name}' is configured"),
            )
        })
    }

    /// Resolve a connection, starting it on first use.
    pub async fn ensure_started(&self, name: &str) -> Result<Arc<ServerConnection>, ToolCallError> {
        let conn = self.get(name)?;
        conn.ensure_started().await?;
        Ok(conn)
    }

    /// Stop a connection and forget it. Returns whether it existed.
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.connections.write().remove(name);
        match removed {
            Some(conn) => {
                conn.stop().await;
                tracing::info!(server = %name, "tool server removed");
                true
            }
            None => false,
        }
    }

    /// Stop every connection concurrently, resolving their pending calls
    /// as cancelled. Calls made afterwards fail with `DispatcherClosed`.
    pub async fn shutdown_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        tracing::info!(count = connections.len(), "shutting down tool servers");
        let futs: Vec<_> = connections.iter().map(|c| c.stop()).collect();
        futures_util::future::join_all(futs).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Status of every connection, sorted by name.
    pub fn status(&self) -> Vec<ConnectionStatus> {
        let mut all: Vec<_> = self.connections.read().values().map(|c| c.status()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// The discovered tool catalog of a server, if any.
    pub fn catalog(&self, name: &str) -> Option<Value> {
        self.connections.read().get(name).and_then(|c| c.catalog())
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.connections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

fn closed_error() -> ToolCallError {
    ToolCallError::new(ErrorKind::DispatcherClosed, "tool server registry is shut down")
}
