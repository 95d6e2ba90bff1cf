use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use ccrelay_core::config::PASSTHROUGH_MODELS;

use crate::app::AppState;

/// GET /v1/models — the live mapping's client-facing ids plus the
/// upstream ids that pass through unmapped.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut ids: Vec<String> = state.models.borrow().keys().cloned().collect();
    for id in PASSTHROUGH_MODELS {
        if !ids.iter().any(|existing| existing == id) {
            ids.push((*id).to_string());
        }
    }

    let data: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "anthropic",
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data}))
}
