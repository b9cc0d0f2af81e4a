//! Server state and configuration.

use std::sync::Arc;

use crate::station::PrintStation;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8080")
    pub listen_addr: String,
}

/// Application state shared across handlers.
#[derive(Debug)]
pub struct AppState {
    pub station: Arc<PrintStation>,
}

impl AppState {
    pub fn new(station: Arc<PrintStation>) -> Self {
        Self { station }
    }
}
