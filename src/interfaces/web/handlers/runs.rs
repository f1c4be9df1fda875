use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
};

use super::super::AppState;
use super::failure;
use crate::core::store::{RunDetail, StoreError};

#[derive(serde::Deserialize, Default)]
pub struct TriggerRequest {
    pub message: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// Creates the run and returns its id without waiting for it to finish.
/// The body is optional.
pub async fn trigger_run_endpoint(
    Path(agent): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> Json<serde_json::Value> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerRequest::default()
    } else {
        match serde_json::from_slice::<TriggerRequest>(&body) {
            Ok(request) => request,
            Err(e) => return failure("invalid", format!("invalid request body: {}", e)),
        }
    };

    let record = match state.store.get_agent(&agent).await {
        Ok(Some(record)) => record,
        Ok(None) => return failure("not_found", "Agent not found"),
        Err(e) => return failure("store", e),
    };
    let message = request.message.filter(|m| !m.trim().is_empty());

    match state.runner.trigger(record, message).await {
        Ok(run_id) => Json(serde_json::json!({ "success": true, "run_id": run_id })),
        Err(e) => failure("store", e),
    }
}

pub async fn list_agent_runs(
    Path(agent): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    match state.store.list_runs(Some(&agent), limit).await {
        Ok(runs) => Json(serde_json::json!({ "success": true, "runs": runs })),
        Err(e) => failure("store", e),
    }
}

pub async fn get_run_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let run = match state.store.get_run(&id).await {
        Ok(run) => run,
        Err(e @ StoreError::RunNotFound(_)) => return failure("not_found", e),
        Err(e @ StoreError::AmbiguousRunId { .. }) => return failure("ambiguous", e),
        Err(e) => return failure("store", e),
    };
    match state.store.get_events(&run.id).await {
        Ok(events) => Json(serde_json::json!({
            "success": true,
            "run": RunDetail { run, events },
        })),
        Err(e) => failure("store", e),
    }
}
