//! Chat Completions API: tool calls arrive as function calls whose arguments
//! are a JSON-encoded string. Also serves local Ollama models.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::http::send_json;
use super::names::{resolve, to_provider_name};
use super::{
    ChatMessage, Completion, CompletionRequest, LlmProvider, ProviderError, ProviderKind,
    StopReason, TokenUsage, ToolCall,
};

pub struct OpenAiProvider {
    client: Client,
    kind: ProviderKind,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(
        client: Client,
        kind: ProviderKind,
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
    ) -> Self {
        Self {
            client,
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn text(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn build_messages(system: &str, messages: &[ChatMessage]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        wire.push(WireMessage::text("system", system));
    }
    for message in messages {
        match message {
            ChatMessage::User(text) => wire.push(WireMessage::text("user", text)),
            ChatMessage::Assistant { text, tool_calls } => wire.push(WireMessage {
                role: "assistant",
                content: (!text.is_empty()).then(|| text.clone()),
                tool_calls: tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: Some(call.id.clone()),
                        kind: function_type(),
                        function: WireFunctionCall {
                            name: to_provider_name(&call.name),
                            arguments: Value::String(call.arguments.to_string()),
                        },
                    })
                    .collect(),
                tool_call_id: None,
            }),
            ChatMessage::ToolResults(results) => {
                wire.extend(results.iter().map(|r| WireMessage {
                    role: "tool",
                    content: Some(r.content.clone()),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(r.call_id.clone()),
                }))
            }
        }
    }
    wire
}

fn build_request<'a>(
    kind: ProviderKind,
    model: &'a str,
    request: &CompletionRequest<'_>,
) -> ChatRequest<'a> {
    // Hosted reasoning models reject `max_tokens`; local servers only know it.
    let (max_tokens, max_completion_tokens) = match kind {
        ProviderKind::Ollama => (Some(request.max_tokens), None),
        _ => (None, Some(request.max_tokens)),
    };
    ChatRequest {
        model,
        messages: build_messages(request.system, request.messages),
        tools: request
            .tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunction {
                    name: to_provider_name(&t.name),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect(),
        max_tokens,
        max_completion_tokens,
    }
}

/// Arguments arrive as a JSON string (some local servers send an object).
/// Anything that is not a JSON object becomes `{}`.
fn parse_arguments(raw: Value, tool: &str) -> Value {
    let parsed = match raw {
        Value::String(s) if s.trim().is_empty() => Value::Object(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(v) => v,
            Err(e) => {
                warn!("Malformed arguments for tool '{}': {}", tool, e);
                Value::Object(Map::new())
            }
        },
        other => other,
    };
    if parsed.is_object() {
        parsed
    } else {
        Value::Object(Map::new())
    }
}

fn parse_response(
    provider: &str,
    response: ChatResponse,
    request: &CompletionRequest<'_>,
) -> Result<Completion, ProviderError> {
    let usage = response.usage.unwrap_or_default();
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason: "response has no choices".to_string(),
        })?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, call)| {
            let name = resolve(&call.function.name, request.tools);
            ToolCall {
                id: call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", i)),
                arguments: parse_arguments(call.function.arguments, &name),
                name,
            }
        })
        .collect();

    let stop_reason = match choice.finish_reason.as_deref() {
        _ if !tool_calls.is_empty() => StopReason::ToolUse,
        Some("length") => StopReason::Length,
        _ => StopReason::Stop,
    };

    Ok(Completion {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        stop_reason,
        usage: TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let body = build_request(self.kind, &self.model, request);
        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let provider = self.kind.as_str();
        let response: ChatResponse = send_json(provider, http).await?;
        parse_response(provider, response, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{ToolResult, ToolSpec};
    use serde_json::json;

    fn tools() -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "fs.read".to_string(),
            description: "Read a file".to_string(),
            input_schema: json!({"type": "object"}),
        }]
    }

    fn response(message: Value, finish_reason: &str) -> ChatResponse {
        serde_json::from_value(json!({
            "choices": [{"message": message, "finish_reason": finish_reason}],
            "usage": {"prompt_tokens": 50, "completion_tokens": 7}
        }))
        .unwrap()
    }

    #[test]
    fn request_puts_system_first_and_tool_results_as_role_tool() {
        let tools = tools();
        let messages = vec![
            ChatMessage::User("Read it".to_string()),
            ChatMessage::Assistant {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "fs.read".to_string(),
                    arguments: json!({"path": "/etc/hosts"}),
                }],
            },
            ChatMessage::ToolResults(vec![ToolResult {
                call_id: "call_1".to_string(),
                content: "127.0.0.1 localhost".to_string(),
                is_error: false,
            }]),
        ];
        let request = CompletionRequest {
            system: "Be brief.",
            messages: &messages,
            tools: &tools,
            max_tokens: 256,
        };
        let wire = serde_json::to_value(build_request(ProviderKind::OpenAi, "gpt-4o", &request)).unwrap();

        assert_eq!(wire["messages"][0]["role"], "system");
        assert_eq!(wire["messages"][0]["content"], "Be brief.");
        assert_eq!(wire["messages"][2]["content"], Value::Null);
        let call = &wire["messages"][2]["tool_calls"][0];
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "fs__read");
        assert_eq!(call["function"]["arguments"], r#"{"path":"/etc/hosts"}"#);
        assert_eq!(wire["messages"][3]["role"], "tool");
        assert_eq!(wire["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(wire["tools"][0]["function"]["name"], "fs__read");
        assert_eq!(wire["max_completion_tokens"], 256);
        assert!(wire.get("max_tokens").is_none());

        let local = serde_json::to_value(build_request(ProviderKind::Ollama, "llama3.1", &request)).unwrap();
        assert_eq!(local["max_tokens"], 256);
    }

    #[test]
    fn tool_calls_are_parsed_and_renamed() {
        let tools = tools();
        let request = CompletionRequest {
            system: "",
            messages: &[],
            tools: &tools,
            max_tokens: 256,
        };
        let completion = parse_response(
            "openai",
            response(
                json!({
                    "content": null,
                    "tool_calls": [{
                        "id": "call_7",
                        "type": "function",
                        "function": {"name": "fs__read", "arguments": "{\"path\":\"/tmp/a\"}"}
                    }]
                }),
                "tool_calls",
            ),
            &request,
        )
        .unwrap();

        assert_eq!(completion.stop_reason, StopReason::ToolUse);
        assert_eq!(completion.tool_calls[0].id, "call_7");
        assert_eq!(completion.tool_calls[0].name, "fs.read");
        assert_eq!(completion.tool_calls[0].arguments["path"], "/tmp/a");
        assert_eq!(completion.usage.input_tokens, 50);
        assert_eq!(completion.usage.output_tokens, 7);
    }

    #[test]
    fn malformed_arguments_become_empty_object() {
        assert_eq!(parse_arguments(json!("{not json"), "fs.read"), json!({}));
        assert_eq!(parse_arguments(json!(""), "fs.read"), json!({}));
        assert_eq!(parse_arguments(json!("[1,2]"), "fs.read"), json!({}));
        assert_eq!(parse_arguments(Value::Null, "fs.read"), json!({}));
        assert_eq!(
            parse_arguments(json!({"path": "/x"}), "fs.read"),
            json!({"path": "/x"})
        );
    }

    #[test]
    fn missing_call_ids_are_generated() {
        let request = CompletionRequest {
            system: "",
            messages: &[],
            tools: &[],
            max_tokens: 256,
        };
        let completion = parse_response(
            "ollama",
            response(
                json!({"content": "", "tool_calls": [{"function": {"name": "clock__now", "arguments": {}}}]}),
                "stop",
            ),
            &request,
        )
        .unwrap();
        assert_eq!(completion.tool_calls[0].id, "call_0");
        assert_eq!(completion.tool_calls[0].name, "clock.now");
        assert_eq!(completion.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn length_finish_is_truncation() {
        let request = CompletionRequest {
            system: "",
            messages: &[],
            tools: &[],
            max_tokens: 256,
        };
        let completion = parse_response(
            "openai",
            response(json!({"content": "partial"}), "length"),
            &request,
        )
        .unwrap();
        assert_eq!(completion.stop_reason, StopReason::Length);
        assert_eq!(completion.text, "partial");
    }

    #[test]
    fn empty_choices_is_invalid() {
        let request = CompletionRequest {
            system: "",
            messages: &[],
            tools: &[],
            max_tokens: 256,
        };
        let empty: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            parse_response("openai", empty, &request),
            Err(ProviderError::InvalidResponse { .. })
        ));
    }
}
