pub mod events;
pub mod runs;
pub mod triggers;
pub mod versions;

use axum::Json;
use serde_json::{Value, json};

pub(super) fn failure(error: impl std::fmt::Display) -> Json<Value> {
    Json(json!({
        "success": false,
        "error": error.to_string()
    }))
}
