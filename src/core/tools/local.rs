use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::adapter::ToolResponse;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<ToolResponse>> + Send>>;
pub type LocalHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// A tool served by an in-process function instead of a subprocess.
#[derive(Clone)]
pub struct LocalTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: LocalHandler,
}

impl LocalTool {
    pub fn new<F, Fut>(name: &str, description: &str, input_schema: Value, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResponse>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

impl std::fmt::Debug for LocalTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub const CLOCK_SERVER: &str = "clock";

/// Tools the daemon serves itself.
pub fn clock_tools() -> Vec<LocalTool> {
    vec![LocalTool::new(
        "now",
        "Current date and time in UTC (RFC 3339) and as a Unix timestamp.",
        json!({ "type": "object", "properties": {} }),
        |_args| async move {
            let now = Utc::now();
            Ok(ToolResponse::text(
                json!({
                    "utc": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "unix": now.timestamp(),
                    "weekday": now.format("%A").to_string(),
                })
                .to_string(),
            ))
        },
    )]
}
