//! Connection handlers.

use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{ApiError, ApiResult};
use super::super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub device_id: String,
}

/// Handle POST /api/connect.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult {
    let device_id = request.device_id.trim();
    if device_id.is_empty() {
        return Err(ApiError::BadRequest("device_id cannot be empty".into()));
    }

    let session = state.station.connect_by_id(device_id).await?;
    Ok(Json(json!({"success": true, "session": session})))
}

/// Handle POST /api/disconnect.
pub async fn disconnect(State(state): State<Arc<AppState>>) -> ApiResult {
    let session = state.station.session();
    session.disconnect().await?;
    Ok(Json(json!({"success": true, "session": session.snapshot()})))
}

/// Handle POST /api/reconnect - one attempt at the last connected device.
pub async fn reconnect(State(state): State<Arc<AppState>>) -> ApiResult {
    let session = state.station.session().reconnect().await?;
    Ok(Json(json!({"success": true, "session": session})))
}
