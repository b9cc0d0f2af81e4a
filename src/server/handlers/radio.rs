//! Radio toggle handlers.

use axum::{Json, extract::State};
use serde_json::json;
use std::sync::Arc;

use super::ApiResult;
use super::super::state::AppState;

/// Handle POST /api/radio/on.
pub async fn enable(State(state): State<Arc<AppState>>) -> ApiResult {
    let radio = state.station.radio();
    radio.enable().await?;
    Ok(Json(json!({"success": true, "radio": radio.state()})))
}

/// Handle POST /api/radio/off.
pub async fn disable(State(state): State<Arc<AppState>>) -> ApiResult {
    let radio = state.station.radio();
    radio.disable().await?;
    Ok(Json(json!({"success": true, "radio": radio.state()})))
}
