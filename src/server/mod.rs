//! # HTTP Control Surface
//!
//! Lets a till UI observe the station and drive the documented operations
//! over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! counterprint serve --listen 0.0.0.0:8080 --device 00:11:62:AA:BB:CC
//! ```
//!
//! ## Routes
//!
//! | Route | Operation |
//! |-------|-----------|
//! | `GET /api/status` | radio, session, queue and device snapshot |
//! | `GET /api/devices` | bonded and available devices |
//! | `POST /api/radio/on`, `/api/radio/off` | toggle the radio |
//! | `POST /api/scan` | run a discovery window (`{"timeout_secs": N}` optional) |
//! | `POST /api/scan/cancel` | stop discovery |
//! | `POST /api/connect` | `{"device_id": "..."}` |
//! | `POST /api/disconnect`, `/api/reconnect` | session control |
//! | `POST /api/print` | `{"text": "...", "document_id": "..."}` |

mod handlers;
mod state;

pub use state::ServerConfig;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{CounterprintError, Result};
use crate::station::PrintStation;
use state::AppState;

/// Build the router over a running station.
pub fn router(station: Arc<PrintStation>) -> Router {
    let app_state = Arc::new(AppState::new(station));

    Router::new()
        .route("/api/status", get(handlers::status))
        // Devices
        .route("/api/devices", get(handlers::devices::list))
        .route("/api/scan", post(handlers::devices::scan))
        .route("/api/scan/cancel", post(handlers::devices::cancel_scan))
        // Radio
        .route("/api/radio/on", post(handlers::radio::enable))
        .route("/api/radio/off", post(handlers::radio::disable))
        // Session
        .route("/api/connect", post(handlers::session::connect))
        .route("/api/disconnect", post(handlers::session::disconnect))
        .route("/api/reconnect", post(handlers::session::reconnect))
        // Printing
        .route("/api/print", post(handlers::print::print))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve the control API until Ctrl-C.
///
/// ## Example
///
/// ```no_run
/// use counterprint::{server::{serve, ServerConfig}, sim::SimulatedBluetooth, PrintStation, StationConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> counterprint::Result<()> {
/// let sim = SimulatedBluetooth::new();
/// let station = Arc::new(PrintStation::start(StationConfig::default(), sim.backend()).await?);
/// let config = ServerConfig {
///     listen_addr: "0.0.0.0:8080".to_string(),
/// };
///
/// serve(station, config).await?;
/// # Ok(())
/// # }
/// ```
pub async fn serve(station: Arc<PrintStation>, config: ServerConfig) -> Result<()> {
    let app = router(station);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| {
            CounterprintError::Config(format!("Failed to bind to {}: {}", config.listen_addr, e))
        })?;

    info!("Counterprint HTTP server listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(CounterprintError::Io)?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
