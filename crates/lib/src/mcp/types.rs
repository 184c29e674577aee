//! Wire types for the tool protocol: JSON-RPC 2.0 envelopes plus the handful of
//! methods we use (`initialize`, `tools/list`, `tools/call`).

use serde::{Deserialize, Serialize};

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Anything the server writes that carries an id. Server-initiated requests also parse as
/// this; they are the ones with a `method`.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: serde_json::Value,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Result of `initialize`; only the fields we log.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    pub tools: Vec<RemoteToolDef>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolsCallResult {
    /// All text parts joined with newlines; non-text parts are dropped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Output for the model: a single text part holding JSON is passed as JSON, anything else as a string.
    pub fn into_value(self) -> serde_json::Value {
        let text = self.text();
        serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .filter(|v| v.is_object() || v.is_array())
            .unwrap_or(serde_json::Value::String(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_without_empty_params() {
        let req = JsonRpcRequest::new(3, "tools/list", None);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"})
        );
    }

    #[test]
    fn tool_def_without_schema_gets_empty_object() {
        let def: RemoteToolDef = serde_json::from_value(json!({"name": "ask"})).unwrap();
        assert_eq!(def.input_schema["type"], "object");
    }

    #[test]
    fn call_result_text_and_value() {
        let result: ToolsCallResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "{\"rows\": 2}"},
                {"type": "image", "data": "..", "mimeType": "image/png"}
            ]
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.into_value(), json!({"rows": 2}));

        let plain: ToolsCallResult =
            serde_json::from_value(json!({"content": [{"type": "text", "text": "42"}]})).unwrap();
        assert_eq!(plain.into_value(), json!("42"));
    }
}
