//! Messages API: tool calls arrive as typed `tool_use` content blocks and
//! results go back as `tool_result` blocks.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::http::send_json;
use super::names::{resolve, to_provider_name};
use super::{
    ChatMessage, Completion, CompletionRequest, LlmProvider, ProviderError, ProviderKind,
    StopReason, TokenUsage, ToolCall,
};

const API_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(client: Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "is_blank")]
    system: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

fn is_blank(text: &&str) -> bool {
    text.is_empty()
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<RequestBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn build_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|message| match message {
            ChatMessage::User(text) => WireMessage {
                role: "user",
                content: vec![RequestBlock::Text { text: text.clone() }],
            },
            ChatMessage::Assistant { text, tool_calls } => {
                let mut content = Vec::with_capacity(tool_calls.len() + 1);
                if !text.is_empty() {
                    content.push(RequestBlock::Text { text: text.clone() });
                }
                content.extend(tool_calls.iter().map(|call| RequestBlock::ToolUse {
                    id: call.id.clone(),
                    name: to_provider_name(&call.name),
                    input: call.arguments.clone(),
                }));
                WireMessage {
                    role: "assistant",
                    content,
                }
            }
            ChatMessage::ToolResults(results) => WireMessage {
                role: "user",
                content: results
                    .iter()
                    .map(|r| RequestBlock::ToolResult {
                        tool_use_id: r.call_id.clone(),
                        content: r.content.clone(),
                        is_error: r.is_error,
                    })
                    .collect(),
            },
        })
        .collect()
}

fn build_request<'a>(model: &'a str, request: &CompletionRequest<'a>) -> MessagesRequest<'a> {
    MessagesRequest {
        model,
        max_tokens: request.max_tokens,
        system: request.system,
        messages: build_messages(request.messages),
        tools: request
            .tools
            .iter()
            .map(|t| WireTool {
                name: to_provider_name(&t.name),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect(),
    }
}

fn parse_stop_reason(reason: Option<&str>, has_tool_calls: bool) -> StopReason {
    match reason {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::Length,
        _ if has_tool_calls => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}

fn parse_response(response: MessagesResponse, request: &CompletionRequest<'_>) -> Completion {
    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ResponseBlock::Text { text: t } => text.push(t),
            ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name: resolve(&name, request.tools),
                arguments: if input.is_object() {
                    input
                } else {
                    Value::Object(Default::default())
                },
            }),
            ResponseBlock::Other => {}
        }
    }

    Completion {
        stop_reason: parse_stop_reason(response.stop_reason.as_deref(), !tool_calls.is_empty()),
        text: text.join("\n"),
        tool_calls,
        usage: TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        },
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let body = build_request(&self.model, request);
        let http = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        let response: MessagesResponse = send_json(PROVIDER, http).await?;
        Ok(parse_response(response, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{ToolResult, ToolSpec};
    use serde_json::json;

    fn tools() -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "github.search_issues".to_string(),
            description: "Search issues".to_string(),
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        }]
    }

    #[test]
    fn request_uses_typed_blocks() {
        let tools = tools();
        let messages = vec![
            ChatMessage::User("Find bugs".to_string()),
            ChatMessage::Assistant {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    id: "toolu_1".to_string(),
                    name: "github.search_issues".to_string(),
                    arguments: json!({"q": "bug"}),
                }],
            },
            ChatMessage::ToolResults(vec![ToolResult {
                call_id: "toolu_1".to_string(),
                content: "Error: rate limited".to_string(),
                is_error: true,
            }]),
        ];
        let request = CompletionRequest {
            system: "You triage issues.",
            messages: &messages,
            tools: &tools,
            max_tokens: 1024,
        };
        let wire = serde_json::to_value(build_request("claude-sonnet-4-20250514", &request)).unwrap();

        assert_eq!(wire["system"], "You triage issues.");
        assert_eq!(wire["max_tokens"], 1024);
        assert_eq!(wire["tools"][0]["name"], "github__search_issues");
        assert_eq!(wire["messages"][1]["role"], "assistant");
        // An empty text block would be rejected by the API.
        assert_eq!(wire["messages"][1]["content"].as_array().unwrap().len(), 1);
        assert_eq!(wire["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(wire["messages"][1]["content"][0]["name"], "github__search_issues");
        let result = &wire["messages"][2]["content"][0];
        assert_eq!(wire["messages"][2]["role"], "user");
        assert_eq!(result["type"], "tool_result");
        assert_eq!(result["tool_use_id"], "toolu_1");
        assert_eq!(result["is_error"], true);
    }

    #[test]
    fn tool_use_response_is_translated_back() {
        let tools = tools();
        let request = CompletionRequest {
            system: "",
            messages: &[],
            tools: &tools,
            max_tokens: 1024,
        };
        let response: MessagesResponse = serde_json::from_value(json!({
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "Searching."},
                {"type": "tool_use", "id": "toolu_9", "name": "github__search_issues", "input": {"q": "crash"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 120, "output_tokens": 30}
        }))
        .unwrap();
        let completion = parse_response(response, &request);

        assert_eq!(completion.stop_reason, StopReason::ToolUse);
        assert_eq!(completion.text, "Searching.");
        assert_eq!(completion.tool_calls[0].name, "github.search_issues");
        assert_eq!(completion.tool_calls[0].arguments["q"], "crash");
        assert_eq!(completion.usage.input_tokens, 120);
    }

    #[test]
    fn max_tokens_maps_to_length() {
        assert_eq!(parse_stop_reason(Some("max_tokens"), false), StopReason::Length);
        assert_eq!(parse_stop_reason(Some("end_turn"), false), StopReason::Stop);
        assert_eq!(parse_stop_reason(None, true), StopReason::ToolUse);
    }
}
