use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde_json::{Value, json};

use super::super::AppState;
use super::failure;
use crate::core::orchestrator::TriggerMeta;

#[derive(serde::Deserialize)]
pub struct SubmitRunRequest {
    version_id: String,
    #[serde(default)]
    input: Value,
    /// Provenance for runs forwarded by an external trigger source.
    #[serde(default)]
    trigger: Option<TriggerMeta>,
}

pub async fn submit_run_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<SubmitRunRequest>,
) -> Json<Value> {
    match state
        .orchestrator
        .submit_run(&payload.version_id, payload.input, payload.trigger)
        .await
    {
        Ok(run_id) => Json(json!({ "success": true, "run_id": run_id, "status": "queued" })),
        Err(e) => failure(e),
    }
}

#[derive(serde::Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_runs_endpoint(
    Query(query): Query<ListRunsQuery>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.orchestrator.store().list_runs(query.limit.min(500)).await {
        Ok(runs) => Json(json!({ "success": true, "runs": runs })),
        Err(e) => failure(e),
    }
}

pub async fn get_run_endpoint(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.orchestrator.run_status(&run_id).await {
        Ok(Some(view)) => Json(json!({ "success": true, "run": view })),
        Ok(None) => failure(format!("run '{}' not found", run_id)),
        Err(e) => failure(e),
    }
}

pub async fn cancel_run_endpoint(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.orchestrator.cancel_run(&run_id).await {
        Ok(outcome) => Json(json!({ "success": true, "cancel": outcome })),
        Err(e) => failure(e),
    }
}
