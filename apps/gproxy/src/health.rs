//! GET /healthz and GET /_status (§4.9, SPEC_FULL.md §C): health probe and
//! active-selection introspection for the external launcher.

use axum::Json;
use axum::extract::State;
use serde_json::{Value as JsonValue, json};

use crate::state::AppState;

pub async fn healthz(State(state): State<AppState>) -> Json<JsonValue> {
    let active = state.active_selection.get().map(|selection| {
        json!({
            "provider": selection.provider.to_string(),
            "model": selection.model,
            "reasoning": selection.reasoning.map(|level| level.to_string()),
        })
    });
    Json(json!({
        "ok": true,
        "pid": state.pid,
        "startedAt": state.started_at,
        "active": active,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn status(State(state): State<AppState>) -> Json<JsonValue> {
    let active = state.active_selection.get().map(|selection| {
        json!({
            "provider": selection.provider.to_string(),
            "model": selection.model,
            "reasoning": selection.reasoning.map(|level| level.to_string()),
        })
    });
    Json(json!({ "active": active }))
}
