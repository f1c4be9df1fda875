pub mod anthropic;
pub mod error;
pub mod factory;
mod http;
pub mod names;
pub mod openai;

pub use error::ProviderError;
pub use factory::{ConfiguredProviders, ProviderSource};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Which wire format and endpoint a model is served through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Typed content blocks (`/messages`).
    Anthropic,
    /// Function-call JSON (`/chat/completions`).
    OpenAi,
    /// Function-call JSON against a local server, no API key.
    Ollama,
}

pub const OLLAMA_PREFIX: &str = "ollama/";

const OPENAI_PREFIXES: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt-"];

impl ProviderKind {
    pub fn from_model(model: &str) -> Option<Self> {
        if model.starts_with("claude-") {
            Some(ProviderKind::Anthropic)
        } else if model.starts_with(OLLAMA_PREFIX) && model.len() > OLLAMA_PREFIX.len() {
            Some(ProviderKind::Ollama)
        } else if OPENAI_PREFIXES.iter().any(|p| model.starts_with(p)) {
            Some(ProviderKind::OpenAi)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool offered to the model, under its registry (dotted) name.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    /// Registry (dotted) name.
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Provider-neutral conversation history. Each provider renders it into
/// its own wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    User(String),
    Assistant {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    ToolResults(Vec<ToolResult>),
}

pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolSpec],
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Stop => "stop",
            StopReason::Length => "length",
            StopReason::ToolUse => "tool_use",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One model turn. Transient failures are reported, not retried.
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_prefixes_select_provider() {
        assert_eq!(
            ProviderKind::from_model("claude-sonnet-4-20250514"),
            Some(ProviderKind::Anthropic)
        );
        assert_eq!(ProviderKind::from_model("gpt-4o"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::from_model("o3-mini"), Some(ProviderKind::OpenAi));
        assert_eq!(
            ProviderKind::from_model("chatgpt-4o-latest"),
            Some(ProviderKind::OpenAi)
        );
        assert_eq!(
            ProviderKind::from_model("ollama/llama3.1"),
            Some(ProviderKind::Ollama)
        );
        assert_eq!(ProviderKind::from_model("ollama/"), None);
        assert_eq!(ProviderKind::from_model("gemini-2.0-flash"), None);
        assert_eq!(ProviderKind::from_model(""), None);
    }
}
