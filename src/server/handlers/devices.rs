//! Device listing and discovery handlers.

use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::ApiResult;
use super::super::state::AppState;

/// Body for POST /api/scan. Omitted fields use the configured defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    pub timeout_secs: Option<u64>,
}

/// Handle GET /api/devices - bonded and available devices.
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult {
    let registry = state.station.registry();
    Ok(Json(json!({
        "success": true,
        "bonded": registry.list_bonded(),
        "available": registry.available(),
        "scanning": registry.is_scanning(),
    })))
}

/// Handle POST /api/scan - run one discovery window and return what it found.
pub async fn scan(
    State(state): State<Arc<AppState>>,
    request: Option<Json<ScanRequest>>,
) -> ApiResult {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let timeout = request
        .timeout_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.station.config().scan_timeout());

    let devices = state.station.registry().start_scan(timeout).await?;
    Ok(Json(json!({"success": true, "devices": devices})))
}

/// Handle POST /api/scan/cancel - stop the running scan.
pub async fn cancel_scan(State(state): State<Arc<AppState>>) -> ApiResult {
    let cancelled = state.station.registry().cancel_scan();
    Ok(Json(json!({"success": true, "cancelled": cancelled})))
}
