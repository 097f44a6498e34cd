use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire format
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Field names used on the wire.
///
/// Outbound records look like `{id, tool, arguments}` and inbound ones like
/// `{id, result}` or `{id, error: {kind, message, data?}}` under the
/// defaults. A JSON-RPC server would use `tool = "method"`,
/// `arguments = "params"`, `error_kind = "code"` and an envelope of
/// `jsonrpc = "2.0"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFormat {
    #[serde(default = "d_id")]
    pub id: String,
    #[serde(default = "d_tool")]
    pub tool: String,
    #[serde(default = "d_arguments")]
    pub arguments: String,
    #[serde(default = "d_result")]
    pub result: String,
    #[serde(default = "d_error")]
    pub error: String,
    #[serde(default = "d_kind")]
    pub error_kind: String,
    #[serde(default = "d_message")]
    pub error_message: String,
    #[serde(default = "d_data")]
    pub error_data: String,
    /// Constant fields stamped on every outbound record.
    #[serde(default)]
    pub envelope: BTreeMap<String, Value>,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            id: d_id(),
            tool: d_tool(),
            arguments: d_arguments(),
            result: d_result(),
            error: d_error(),
            error_kind: d_kind(),
            error_message: d_message(),
            error_data: d_data(),
            envelope: BTreeMap::new(),
        }
    }
}

impl WireFormat {
    /// Field names that share a single record and therefore must differ.
    pub fn duplicate_fields(&self) -> Vec<&str> {
        let outbound: [&str; 3] = [&self.id, &self.tool, &self.arguments];
        let inbound: [&str; 3] = [&self.id, &self.result, &self.error];
        let error: [&str; 3] = [&self.error_kind, &self.error_message, &self.error_data];

        let mut dups = Vec::new();
        for group in [outbound, inbound, error] {
            for (i, &a) in group.iter().enumerate() {
                if group[i + 1..].contains(&a) && !dups.contains(&a) {
                    dups.push(a);
                }
            }
        }
        dups
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_id() -> String {
    "id".into()
}
fn d_tool() -> String {
    "tool".into()
}
fn d_arguments() -> String {
    "arguments".into()
}
fn d_result() -> String {
    "result".into()
}
fn d_error() -> String {
    "error".into()
}
fn d_kind() -> String {
    "kind".into()
}
fn d_message() -> String {
    "message".into()
}
fn d_data() -> String {
    "data".into()
}
