use axum::{
    Json,
    extract::{Path, State},
};

use super::super::AppState;
use super::failure;
use crate::core::tools::{RegisterOptions, ServerConfig, ToolError, ToolSource};

pub async fn get_tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tools = state.tools.list_tools().await;
    let servers = state.tools.server_names().await;
    Json(serde_json::json!({ "success": true, "servers": servers, "tools": tools }))
}

/// Spawn a tool server at runtime, replacing any server of the same name.
pub async fn register_server_endpoint(
    Path(server): Path<String>,
    State(state): State<AppState>,
    Json(config): Json<ServerConfig>,
) -> Json<serde_json::Value> {
    if config.command.trim().is_empty() {
        return failure("invalid", "command must not be empty");
    }
    let options = RegisterOptions { replace: true };
    match state
        .tools
        .register_server(&server, &config, ToolSource::Api, options)
        .await
    {
        Ok(tools) => Json(serde_json::json!({ "success": true, "server": server, "tools": tools })),
        Err(e @ ToolError::InvalidServerName(_)) => failure("invalid", e),
        Err(e) => failure("connect", e),
    }
}

pub async fn disconnect_server_endpoint(
    Path(server): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    if state.tools.disconnect_server(&server).await {
        Json(serde_json::json!({ "success": true, "server": server }))
    } else {
        failure("not_found", format!("tool server '{}' not found", server))
    }
}
