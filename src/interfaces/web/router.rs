use axum::{
    Json, Router,
    routing::{get, post, put},
};

use super::AppState;
use super::handlers::{agents, runs, tools};

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/agents", get(agents::get_agents))
        .route(
            "/api/agents/{agent}",
            put(agents::upsert_agent_endpoint).delete(agents::delete_agent_endpoint),
        )
        .route(
            "/api/agents/{agent}/runs",
            post(runs::trigger_run_endpoint).get(runs::list_agent_runs),
        )
        .route("/api/runs/{id}", get(runs::get_run_endpoint))
        .route("/api/tools", get(tools::get_tools))
        .route(
            "/api/tools/servers/{server}",
            put(tools::register_server_endpoint).delete(tools::disconnect_server_endpoint),
        )
        .with_state(state)
}
