use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::ServerConfig;

/// A tool as advertised by its server, before namespacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Result envelope of one tool call. Tool-level failures are reported
/// through `is_error`, never as an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![serde_json::json!({ "type": "text", "text": text.into() })],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// Flatten the content blocks for a model: text blocks verbatim, anything
    /// else as compact JSON.
    pub fn to_text(&self) -> String {
        self.content
            .iter()
            .map(|block| match (block.get("type"), block.get("text")) {
                (Some(t), Some(Value::String(text))) if t == "text" => text.clone(),
                _ => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One connected tool server.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Queries the server each time; nothing is cached here.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResponse>;

    /// Bounded wait; never fails because the server is slow or already gone.
    async fn disconnect(&self) -> Result<()>;
}

/// Creates adapters for configured servers. The daemon uses
/// [`crate::core::mcp::McpConnector`]; tests substitute their own.
#[async_trait]
pub trait AdapterConnector: Send + Sync {
    async fn connect(&self, name: &str, config: &ServerConfig) -> Result<Arc<dyn ToolAdapter>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn to_text_joins_blocks() {
        let response = ToolResponse {
            content: vec![
                json!({"type": "text", "text": "first"}),
                json!({"type": "image", "data": "AA=="}),
                json!({"type": "text", "text": "second"}),
            ],
            is_error: false,
        };
        let text = response.to_text();
        assert!(text.starts_with("first\n"));
        assert!(text.contains("\"image\""));
        assert!(text.ends_with("\nsecond"));
    }

    #[test]
    fn parses_wire_envelope() {
        let response: ToolResponse = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "no such file"}],
            "isError": true
        }))
        .unwrap();
        assert!(response.is_error);
        assert_eq!(response.to_text(), "no such file");

        let bare: ToolResponse = serde_json::from_value(json!({})).unwrap();
        assert!(!bare.is_error);
        assert!(bare.content.is_empty());
    }

    #[test]
    fn tool_info_defaults_schema() {
        let info: ToolInfo = serde_json::from_value(json!({"name": "now"})).unwrap();
        assert_eq!(info.input_schema["type"], "object");
        assert!(info.description.is_none());
    }
}
