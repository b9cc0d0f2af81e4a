//! Manual print handler.
//!
//! Manual prints share the station's single FIFO queue with the background
//! print queue, so a manual receipt waits behind any job already queued.

use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{ApiError, ApiResult};
use super::super::state::AppState;
use crate::printer::PrintJob;

/// Body for POST /api/print.
#[derive(Debug, Deserialize)]
pub struct PrintRequest {
    /// Defaults to a fresh UUID
    pub document_id: Option<String>,
    /// Receipt text, sent as-is
    pub text: String,
}

/// Handle POST /api/print - print text and wait for the outcome.
pub async fn print(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PrintRequest>,
) -> ApiResult {
    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("Text cannot be empty".into()));
    }

    let document_id = request
        .document_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut payload = request.text.into_bytes();
    if !payload.ends_with(b"\n") {
        payload.push(b'\n');
    }

    state
        .station
        .printer()
        .submit(PrintJob::new(document_id.clone(), payload))
        .await
        .into_result()?;

    Ok(Json(json!({"success": true, "document_id": document_id})))
}
