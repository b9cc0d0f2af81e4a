//! # Print Station
//!
//! The process-wide owner of the Bluetooth core. [`PrintStation::start`]
//! builds every component over a [`Backend`], wires radio transitions into
//! the registry and session, and hands out shared handles:
//!
//! ```text
//! RadioStateMonitor ─▶ DeviceRegistry ─▶ ConnectionSession ─▶ PrintJobSerializer ─▶ PrintQueueOrchestrator
//! ```
//!
//! There is exactly one of each per station, so there is exactly one
//! printer link per process.

use serde::Serialize;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::StationConfig;
use crate::error::Result;
use crate::permissions::PermissionGate;
use crate::printer::{PrintJobSerializer, QueueActivity};
use crate::queue::{DocumentSource, PrintQueueOrchestrator};
use crate::radio::{RadioAdapter, RadioState, RadioStateMonitor, Subscription};
use crate::registry::{Device, DeviceRegistry, DeviceScanner};
use crate::session::{ConnectionSession, SessionSnapshot};
use crate::transport::LinkConnector;

/// The OS-facing pieces a station runs on
pub struct Backend {
    pub radio: Arc<dyn RadioAdapter>,
    pub scanner: Arc<dyn DeviceScanner>,
    pub connector: Arc<dyn LinkConnector>,
    pub permissions: Arc<dyn PermissionGate>,
    /// OS radio events, if the backend produces them
    pub radio_events: Option<mpsc::UnboundedReceiver<RadioState>>,
}

impl Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("radio", &self.radio)
            .field("scanner", &self.scanner)
            .field("connector", &self.connector)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

/// Everything a status display needs, in one read
#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub radio: RadioState,
    pub scanning: bool,
    pub session: SessionSnapshot,
    pub queue: QueueActivity,
    pub bonded: Arc<Vec<Device>>,
    pub available: Arc<Vec<Device>>,
}

/// Owns one of each core component
pub struct PrintStation {
    config: StationConfig,
    radio: Arc<RadioStateMonitor>,
    registry: Arc<DeviceRegistry>,
    session: Arc<ConnectionSession>,
    printer: Arc<PrintJobSerializer>,
    _radio_subscription: Subscription,
    radio_pump: Option<JoinHandle<()>>,
}

impl PrintStation {
    /// Build and wire the components, then read the initial radio state.
    pub async fn start(config: StationConfig, backend: Backend) -> Result<Self> {
        config.validate()?;

        let radio = Arc::new(RadioStateMonitor::new(
            backend.radio.clone(),
            config.radio_toggle_timeout(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            backend.scanner.clone(),
            backend.permissions.clone(),
            radio.watch(),
        ));
        let session = Arc::new(ConnectionSession::new(
            backend.connector.clone(),
            backend.permissions.clone(),
            radio.watch(),
            config.connect_timeout(),
        ));
        let printer = Arc::new(PrintJobSerializer::spawn(session.clone(), config.write_timeout()));

        let subscription = {
            let registry = registry.clone();
            let session = session.clone();
            radio.on_change(move |state| {
                registry.handle_radio_state(state);
                session.handle_radio_state(state);
                if state == RadioState::On
                    && let Ok(handle) = tokio::runtime::Handle::try_current()
                {
                    let registry = registry.clone();
                    handle.spawn(async move {
                        if let Err(e) = registry.refresh_bonded().await {
                            warn!("Could not refresh bonded devices: {}", e);
                        }
                    });
                }
            })
        };

        match radio.refresh().await {
            Ok(state) => info!("Bluetooth radio is {}", state),
            Err(e) => warn!("Could not read radio state: {}", e),
        }
        let radio_pump = backend.radio_events.map(|events| radio.follow(events));

        Ok(Self {
            config,
            radio,
            registry,
            session,
            printer,
            _radio_subscription: subscription,
            radio_pump,
        })
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn radio(&self) -> &Arc<RadioStateMonitor> {
        &self.radio
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    pub fn printer(&self) -> &Arc<PrintJobSerializer> {
        &self.printer
    }

    /// An orchestrator feeding `source` into this station's printer.
    pub fn print_queue(&self, source: Arc<dyn DocumentSource>) -> Arc<PrintQueueOrchestrator> {
        Arc::new(PrintQueueOrchestrator::new(
            source,
            self.printer.clone(),
            self.session.clone(),
            &self.config,
        ))
    }

    pub fn status(&self) -> StationStatus {
        StationStatus {
            radio: self.radio.state(),
            scanning: self.registry.is_scanning(),
            session: self.session.snapshot(),
            queue: self.printer.activity(),
            bonded: self.registry.list_bonded(),
            available: self.registry.available(),
        }
    }

    /// Connect to a device by id.
    ///
    /// Looks in the registry first (re-reading the bonded list on a miss),
    /// then falls back to the bare address.
    pub async fn connect_by_id(&self, id: &str) -> Result<SessionSnapshot> {
        let known = match self.registry.find(id) {
            Some(device) => Some(device),
            None => {
                if let Err(e) = self.registry.refresh_bonded().await {
                    warn!("Could not refresh bonded devices: {}", e);
                }
                self.registry.find(id)
            }
        };
        let device = known.unwrap_or_else(|| Device::discovered(id, id));
        self.session.connect(&device).await
    }

    /// Cancel any scan and drop the printer link.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down print station");
        self.registry.cancel_scan();
        self.session.disconnect().await
    }
}

impl Drop for PrintStation {
    fn drop(&mut self) {
        if let Some(pump) = self.radio_pump.take() {
            pump.abort();
        }
    }
}

impl Debug for PrintStation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrintStation")
            .field("radio", &self.radio)
            .field("registry", &self.registry)
            .field("session", &self.session.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBluetooth;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_start_reads_radio_and_bonded() {
        let sim = SimulatedBluetooth::new().with_bonded("00:11:62:00:00:01", "Printer1");
        let station = PrintStation::start(StationConfig::default(), sim.backend())
            .await
            .unwrap();

        assert_eq!(station.radio().state(), RadioState::On);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(station.registry().list_bonded().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_by_unknown_id_uses_address() {
        let sim = SimulatedBluetooth::new();
        let station = PrintStation::start(StationConfig::default(), sim.backend())
            .await
            .unwrap();

        let snapshot = station.connect_by_id("00:11:62:00:00:09").await.unwrap();
        assert_eq!(snapshot.device.unwrap().display_name, "00:11:62:00:00:09");
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_radio_off_reaches_session() {
        let sim = SimulatedBluetooth::new().with_bonded("00:11:62:00:00:01", "Printer1");
        let station = PrintStation::start(StationConfig::default(), sim.backend())
            .await
            .unwrap();
        station.connect_by_id("00:11:62:00:00:01").await.unwrap();

        sim.power_externally(false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = station.status();
        assert_eq!(status.radio, RadioState::Off);
        assert!(!status.session.is_connected());
        assert!(status.bonded.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let sim = SimulatedBluetooth::new();
        let config = StationConfig {
            scan_timeout_secs: 0,
            ..StationConfig::default()
        };
        assert!(PrintStation::start(config, sim.backend()).await.is_err());
    }
}
