pub mod agents;
pub mod runs;
pub mod tools;

use axum::Json;

fn failure(code: &str, error: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": false, "code": code, "error": error.to_string() }))
}
