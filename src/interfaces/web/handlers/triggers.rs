use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::super::AppState;
use super::failure;
use crate::core::triggers::NewTrigger;

pub async fn list_triggers_endpoint(State(state): State<AppState>) -> Json<Value> {
    match state.scheduler.list().await {
        Ok(triggers) => Json(json!({ "success": true, "triggers": triggers })),
        Err(e) => failure(e),
    }
}

pub async fn create_trigger_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<NewTrigger>,
) -> Json<Value> {
    match state.scheduler.register(payload).await {
        Ok(trigger) => Json(json!({ "success": true, "trigger": trigger })),
        Err(e) => failure(e),
    }
}

pub async fn delete_trigger_endpoint(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.scheduler.remove(&trigger_id).await {
        Ok(true) => Json(json!({ "success": true })),
        Ok(false) => failure(format!("trigger '{}' not found", trigger_id)),
        Err(e) => failure(e),
    }
}

pub async fn fire_trigger_endpoint(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.scheduler.fire(&trigger_id, None).await {
        Ok(outcome) => Json(json!({ "success": true, "fire": outcome })),
        Err(e) => failure(e),
    }
}

pub async fn list_fires_endpoint(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.scheduler.fires(&trigger_id).await {
        Ok(fires) => Json(json!({ "success": true, "fires": fires })),
        Err(e) => failure(e),
    }
}
