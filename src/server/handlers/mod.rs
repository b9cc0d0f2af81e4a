//! HTTP handlers for the server.
//!
//! Every handler answers with a JSON object carrying `"success"`. Failures
//! add `"error"` and a status code that says whose fault it was.

pub mod devices;
pub mod print;
pub mod radio;
pub mod session;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::sync::Arc;

use super::state::AppState;
use crate::error::CounterprintError;
use crate::station::StationStatus;

/// Handler error carrying its HTTP status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Core(CounterprintError),
}

impl From<CounterprintError> for ApiError {
    fn from(e: CounterprintError) -> Self {
        ApiError::Core(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) if e.is_caller_error() => StatusCode::CONFLICT,
            ApiError::Core(CounterprintError::PermissionDenied(_)) => StatusCode::FORBIDDEN,
            ApiError::Core(CounterprintError::ConnectTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Core(CounterprintError::Transport(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Core(CounterprintError::Radio(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Core(CounterprintError::Config(_)) => StatusCode::BAD_REQUEST,
            ApiError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::Core(e) => e.to_string(),
        };
        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}

pub type ApiResult = Result<Json<Value>, ApiError>;

/// Handle GET /api/status - full station snapshot.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StationStatus> {
    Json(state.station.status())
}
