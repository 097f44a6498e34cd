//! Tool server configuration types, re-exported from `tw-domain`.
//!
//! The canonical definitions live in `tw_domain::config` so that an
//! application's config deserializer can include them without depending
//! on the full client crate.

pub use tw_domain::config::{
    HandshakeConfig, RestartPolicy, StartPolicy, ToolServerConfig, ToolServersConfig, WireFormat,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_defaults() {
        let cfg: ToolServersConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.servers.is_empty());
        assert_eq!(cfg.start_policy, StartPolicy::Lazy);
    }

    #[test]
    fn deserialize_server_config() {
        let raw = r#"{
            "name": "filesystem",
            "command": "fs-tools",
            "args": ["--root", "/tmp"],
            "handshake": { "tool": "initialize" },
            "restart": { "max_attempts": 3 }
        }"#;
        let cfg: ToolServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.name, "filesystem");
        assert_eq!(cfg.args.len(), 2);
        assert_eq!(cfg.handshake.as_ref().map(|h| h.tool.as_str()), Some("initialize"));
        assert!(cfg.restart.enabled());
        assert_eq!(cfg.wire, WireFormat::default());
    }

    #[test]
    fn restart_disabled_by_default() {
        let raw = r#"{ "name": "test", "command": "echo" }"#;
        let cfg: ToolServerConfig = serde_json::from_str(raw).unwrap();
        assert!(!cfg.restart.enabled());
        assert_eq!(cfg.restart, RestartPolicy::default());
    }
}
