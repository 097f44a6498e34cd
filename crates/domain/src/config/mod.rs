mod server;
mod wire;

pub use server::*;
pub use wire::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The set of tool servers an application talks to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolServersConfig {
    #[serde(default)]
    pub start_policy: StartPolicy,
    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
}

/// When connections get started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    /// On the first call routed to the server.
    #[default]
    Lazy,
    /// All at once, when the owner calls `start_all`.
    Eager,
}

impl ToolServersConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl ToolServersConfig {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.servers.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "servers".into(),
                message: "no tool servers configured".into(),
            });
        }

        let mut seen = HashSet::new();
        for (i, server) in self.servers.iter().enumerate() {
            let prefix = format!("servers[{i}]");
            let error = |field: &str, message: String| ConfigIssue {
                severity: ConfigSeverity::Error,
                field: format!("{prefix}.{field}"),
                message,
            };

            if server.name.is_empty() {
                issues.push(error("name", "name must not be empty".into()));
            } else if !seen.insert(server.name.as_str()) {
                issues.push(error(
                    "name",
                    format!("duplicate server name '{}'", server.name),
                ));
            }

            if server.command.is_empty() {
                issues.push(error("command", "command must not be empty".into()));
            }
            if server.startup_timeout_ms == 0 {
                issues.push(error(
                    "startup_timeout_ms",
                    "must be greater than 0".into(),
                ));
            }
            if server.default_call_timeout_ms == 0 {
                issues.push(error(
                    "default_call_timeout_ms",
                    "must be greater than 0".into(),
                ));
            }
            if server.max_frame_bytes == 0 {
                issues.push(error("max_frame_bytes", "must be greater than 0".into()));
            }
            if server.restart.enabled() && server.restart.backoff_factor < 1.0 {
                issues.push(error(
                    "restart.backoff_factor",
                    "must be at least 1.0".into(),
                ));
            }

            for dup in server.wire.duplicate_fields() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    field: format!("{prefix}.wire"),
                    message: format!("field name '{dup}' is used twice in one record"),
                });
            }
        }

        issues
    }

    /// Validate and fail on the first error-severity issue.
    pub fn validate_strict(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|i| i.severity == ConfigSeverity::Error)
        {
            Some(issue) => Err(Error::Config(issue.to_string())),
            None => Ok(()),
        }
    }
}
