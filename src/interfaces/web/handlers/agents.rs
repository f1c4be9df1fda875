use axum::{
    Json,
    extract::{Path, State},
};
use tracing::{info, warn};

use super::super::AppState;
use super::failure;
use crate::core::agent::{Agent, Trigger};
use crate::core::llm::ProviderKind;

pub async fn get_agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.store.list_agents().await {
        Ok(agents) => Json(serde_json::json!({ "success": true, "agents": agents })),
        Err(e) => failure("store", e),
    }
}

#[derive(serde::Deserialize)]
pub struct UpsertAgentRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    tools: Vec<String>,
    /// `"manual"` or `"cron:<expr>"`; defaults to manual only.
    #[serde(default)]
    triggers: Option<Vec<String>>,
}

fn valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub async fn upsert_agent_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<UpsertAgentRequest>,
) -> Json<serde_json::Value> {
    if !valid_agent_name(&name) {
        return failure(
            "invalid",
            format!("invalid agent name '{}': use letters, digits, '-' or '_'", name),
        );
    }
    let model = payload.model.trim().to_string();
    if ProviderKind::from_model(&model).is_none() {
        return failure("invalid", format!("unsupported model '{}'", model));
    }

    let triggers = match payload.triggers {
        None => vec![Trigger::Manual],
        Some(raw) => {
            let mut parsed = Vec::with_capacity(raw.len());
            for entry in raw {
                match entry.parse::<Trigger>() {
                    Ok(trigger) => parsed.push(trigger),
                    Err(e) => return failure("invalid", e),
                }
            }
            parsed
        }
    };

    let agent = Agent {
        name: name.clone(),
        model,
        prompt: payload.prompt,
        tools: payload.tools,
        triggers,
        next_run: None,
    };
    if let Err(e) = state.store.upsert_agent(&agent).await {
        return failure("store", e);
    }

    let timers = match state.scheduler.schedule_agent(&name, &agent.triggers).await {
        Ok(count) => count,
        Err(e) => {
            warn!("Agent [{}] saved but could not be scheduled: {}", name, e);
            return failure("schedule", format!("agent saved but not scheduled: {}", e));
        }
    };
    info!("Agent [{}] saved", name);

    match state.store.get_agent(&name).await {
        Ok(Some(saved)) => {
            Json(serde_json::json!({ "success": true, "agent": saved, "timers": timers }))
        }
        Ok(None) => failure("not_found", "Agent not found"),
        Err(e) => failure("store", e),
    }
}

pub async fn delete_agent_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    if let Err(e) = state.scheduler.unschedule_agent(&name).await {
        warn!("Failed to unschedule agent [{}]: {}", name, e);
    }
    match state.store.delete_agent(&name).await {
        Ok(true) => {
            info!("Agent [{}] deleted", name);
            Json(serde_json::json!({ "success": true }))
        }
        Ok(false) => failure("not_found", "Agent not found"),
        Err(e) => failure("store", e),
    }
}
