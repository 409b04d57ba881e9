use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::super::AppState;
use super::failure;

pub async fn ingest_event_endpoint(
    Path(source): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    let source = source.trim().to_string();
    if source.is_empty() {
        return failure("event source is required");
    }
    match state.scheduler.fire_event(&source, payload).await {
        Ok(fired) => {
            let fired: Vec<Value> = fired
                .into_iter()
                .map(|(trigger_id, outcome)| json!({ "trigger_id": trigger_id, "fire": outcome }))
                .collect();
            Json(json!({ "success": true, "fired": fired }))
        }
        Err(e) => failure(e),
    }
}
