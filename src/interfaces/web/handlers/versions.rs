use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::super::AppState;
use super::failure;
use crate::core::version::AgentConfig;

#[derive(serde::Deserialize)]
pub struct PublishRequest {
    agent_id: String,
    config: AgentConfig,
}

pub async fn publish_version_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<PublishRequest>,
) -> Json<Value> {
    match state
        .orchestrator
        .versions()
        .publish(&payload.agent_id, &payload.config)
        .await
    {
        Ok(version_id) => Json(json!({ "success": true, "version_id": version_id })),
        Err(e) => failure(e),
    }
}

pub async fn get_version_endpoint(
    Path(version_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.orchestrator.versions().get(&version_id).await {
        Ok(Some(version)) => Json(json!({ "success": true, "version": version.as_ref() })),
        Ok(None) => failure(format!("version '{}' not found", version_id)),
        Err(e) => failure(e),
    }
}

pub async fn list_agent_versions_endpoint(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.orchestrator.versions().list_for_agent(&agent_id).await {
        Ok(versions) => Json(json!({ "success": true, "versions": versions })),
        Err(e) => failure(e),
    }
}

pub async fn latest_agent_version_endpoint(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.orchestrator.versions().latest_for_agent(&agent_id).await {
        Ok(Some(version)) => Json(json!({ "success": true, "version": version })),
        Ok(None) => failure(format!("agent '{}' has no published versions", agent_id)),
        Err(e) => failure(e),
    }
}
