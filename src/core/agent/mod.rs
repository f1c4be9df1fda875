mod trigger;

pub use trigger::Trigger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted agent definition: prompt, model, tool access and triggers.
///
/// Definitions are produced by the CRUD layer; `next_run` is owned by the
/// scheduler and ignored on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub model: String,
    pub prompt: String,
    /// `server.tool` for a single tool, or a bare `server` for all of its tools.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

fn default_triggers() -> Vec<Trigger> {
    vec![Trigger::Manual]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolRef<'a> {
    /// A namespaced `server.tool` name.
    Tool(&'a str),
    /// Every tool registered by the server.
    Server(&'a str),
}

impl<'a> ToolRef<'a> {
    pub fn parse(reference: &'a str) -> Self {
        if reference.contains('.') {
            ToolRef::Tool(reference)
        } else {
            ToolRef::Server(reference)
        }
    }
}

impl Agent {
    pub fn tool_refs(&self) -> impl Iterator<Item = ToolRef<'_>> {
        self.tools.iter().map(|t| ToolRef::parse(t.trim()))
    }
}
