//! # Device Registry
//!
//! Keeps the two device lists a print station cares about:
//!
//! - **Bonded**: devices paired at the OS level, cached and re-fetched when
//!   the radio comes on or on request.
//! - **Available**: devices found by the current (or last) discovery scan.
//!
//! Both lists are `Arc<Vec<Device>>` snapshots that are replaced whole on
//! every change, never edited in place, so an observer holding an old
//! snapshot never sees a half-applied update.
//!
//! ## Scanning
//!
//! Only one scan runs at a time. A scan ends when its window elapses, when
//! [`DeviceRegistry::cancel_scan`] is called, or when the radio leaves `On`.
//! In the last case the Available list is emptied and the scan still resolves
//! successfully: losing the radio is an expected event, not a fault.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{CounterprintError, Result};
use crate::lock;
use crate::permissions::{self, PermissionGate, BLUETOOTH_PERMISSIONS};
use crate::radio::RadioState;

/// How a device became known to the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    Bonded,
    Discovered,
}

/// Snapshot of a Bluetooth peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Platform identifier (the MAC address on Linux)
    pub id: String,
    pub display_name: String,
    pub bond_state: BondState,
}

impl Device {
    pub fn bonded(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            bond_state: BondState::Bonded,
        }
    }

    pub fn discovered(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            bond_state: BondState::Discovered,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// OS-level device enumeration and discovery
#[async_trait]
pub trait DeviceScanner: Send + Sync + Debug {
    /// Devices paired with this host
    async fn bonded_devices(&self) -> Result<Vec<Device>>;

    /// Begin a discovery session. It runs until the returned handle is dropped.
    async fn start_discovery(&self) -> Result<Discovery>;
}

/// One discovery session.
///
/// Devices arrive as they are found. Dropping the handle ends this session
/// and no other.
pub struct Discovery {
    found: mpsc::UnboundedReceiver<Device>,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl Discovery {
    /// `stop` runs once, when the handle is dropped.
    pub fn new(found: mpsc::UnboundedReceiver<Device>, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            found,
            stop: Some(Box::new(stop)),
        }
    }

    /// Next device found, or `None` once the backend stops reporting.
    pub async fn next(&mut self) -> Option<Device> {
        self.found.recv().await
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("running", &self.stop.is_some())
            .finish()
    }
}

struct ActiveScan {
    id: u64,
    cancel: oneshot::Sender<()>,
}

/// Bonded and discovered devices, plus the single discovery session
pub struct DeviceRegistry {
    scanner: Arc<dyn DeviceScanner>,
    permissions: Arc<dyn PermissionGate>,
    radio: watch::Receiver<RadioState>,
    bonded_tx: watch::Sender<Arc<Vec<Device>>>,
    available_tx: watch::Sender<Arc<Vec<Device>>>,
    scan: Mutex<Option<ActiveScan>>,
    next_scan_id: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(
        scanner: Arc<dyn DeviceScanner>,
        permissions: Arc<dyn PermissionGate>,
        radio: watch::Receiver<RadioState>,
    ) -> Self {
        let (bonded_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (available_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            scanner,
            permissions,
            radio,
            bonded_tx,
            available_tx,
            scan: Mutex::new(None),
            next_scan_id: AtomicU64::new(1),
        }
    }

    /// Cached bonded devices
    pub fn list_bonded(&self) -> Arc<Vec<Device>> {
        self.bonded_tx.borrow().clone()
    }

    /// Devices found by the current or last scan
    pub fn available(&self) -> Arc<Vec<Device>> {
        self.available_tx.borrow().clone()
    }

    pub fn watch_bonded(&self) -> watch::Receiver<Arc<Vec<Device>>> {
        self.bonded_tx.subscribe()
    }

    pub fn watch_available(&self) -> watch::Receiver<Arc<Vec<Device>>> {
        self.available_tx.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.scan).is_some()
    }

    /// Look a device up by id, bonded list first.
    pub fn find(&self, id: &str) -> Option<Device> {
        self.list_bonded()
            .iter()
            .chain(self.available().iter())
            .find(|device| device.id == id)
            .cloned()
    }

    /// Re-fetch the bonded list from the OS.
    pub async fn refresh_bonded(&self) -> Result<Arc<Vec<Device>>> {
        permissions::require(self.permissions.as_ref(), &BLUETOOTH_PERMISSIONS).await?;
        self.ensure_radio_on()?;

        let devices: Vec<Device> = self
            .scanner
            .bonded_devices()
            .await?
            .into_iter()
            .map(|device| Device {
                bond_state: BondState::Bonded,
                ..device
            })
            .collect();

        // The radio may have gone off while the OS answered
        if *self.radio.borrow() != RadioState::On {
            debug!("Radio left On during bonded refresh; discarding result");
            return Ok(self.list_bonded());
        }

        info!("{} bonded device(s)", devices.len());
        let devices = Arc::new(devices);
        self.bonded_tx.send_replace(devices.clone());
        Ok(devices)
    }

    /// Run one discovery session for at most `timeout`.
    ///
    /// Resolves with the Available list once the session ends.
    pub async fn start_scan(&self, timeout: Duration) -> Result<Arc<Vec<Device>>> {
        permissions::require(self.permissions.as_ref(), &BLUETOOTH_PERMISSIONS).await?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let scan_id = {
            let mut slot = lock(&self.scan);
            if slot.is_some() {
                return Err(CounterprintError::ScanInProgress);
            }
            // Checked under the scan lock so a concurrent radio-off either
            // sees this scan or is seen by it.
            self.ensure_radio_on()?;

            let id = self.next_scan_id.fetch_add(1, Ordering::Relaxed);
            *slot = Some(ActiveScan {
                id,
                cancel: cancel_tx,
            });
            self.available_tx.send_replace(Arc::new(Vec::new()));
            id
        };

        info!("Starting device scan {} ({:?})", scan_id, timeout);
        let mut discovery = match self.scanner.start_discovery().await {
            Ok(discovery) => discovery,
            Err(e) => {
                warn!("Could not start discovery: {}", e);
                self.finish_scan(scan_id);
                return Err(e);
            }
        };

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                _ = &mut deadline => break "timed out",
                _ = &mut cancel_rx => break "cancelled",
                device = discovery.next() => match device {
                    Some(device) => self.record_discovered(scan_id, device),
                    None => break "finished",
                },
            }
        };

        drop(discovery);
        self.finish_scan(scan_id);

        let available = self.available();
        info!(
            "Device scan {} {}: {} device(s) available",
            scan_id,
            reason,
            available.len()
        );
        Ok(available)
    }

    /// Stop the running scan, if any. Returns whether one was running.
    pub fn cancel_scan(&self) -> bool {
        match lock(&self.scan).take() {
            Some(scan) => {
                info!("Cancelling device scan {}", scan.id);
                let _ = scan.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// React to a radio transition. Anything other than `On` ends the scan
    /// and empties Available; `Off` empties Bonded too. Observers receive the
    /// empty snapshots.
    pub fn handle_radio_state(&self, state: RadioState) {
        if state == RadioState::On {
            return;
        }

        let mut slot = lock(&self.scan);
        if let Some(scan) = slot.take() {
            info!("Radio is {}; stopping device scan {}", state, scan.id);
            let _ = scan.cancel.send(());
        }
        self.available_tx.send_replace(Arc::new(Vec::new()));
        if state == RadioState::Off {
            self.bonded_tx.send_replace(Arc::new(Vec::new()));
        }
    }

    fn ensure_radio_on(&self) -> Result<()> {
        let state = *self.radio.borrow();
        if state == RadioState::On {
            Ok(())
        } else {
            Err(CounterprintError::Radio(format!("Bluetooth radio is {}", state)))
        }
    }

    fn record_discovered(&self, scan_id: u64, device: Device) {
        let slot = lock(&self.scan);
        if slot.as_ref().map(|scan| scan.id) != Some(scan_id) {
            return;
        }

        let device = Device {
            bond_state: BondState::Discovered,
            ..device
        };
        let current = self.available_tx.borrow().clone();
        let mut next = current.as_ref().clone();
        match next.iter().position(|known| known.id == device.id) {
            Some(index) if next[index] == device => return,
            Some(index) => next[index] = device,
            None => {
                debug!("Discovered {}", device);
                next.push(device);
            }
        }
        self.available_tx.send_replace(Arc::new(next));
    }

    fn finish_scan(&self, scan_id: u64) {
        let mut slot = lock(&self.scan);
        if slot.as_ref().map(|scan| scan.id) == Some(scan_id) {
            *slot = None;
        }
    }
}

impl Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("bonded", &self.list_bonded().len())
            .field("available", &self.available().len())
            .field("scanning", &self.is_scanning())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{Permission, StaticPermissions};
    use crate::sim::SimulatedBluetooth;
    use pretty_assertions::assert_eq;

    fn sim() -> SimulatedBluetooth {
        SimulatedBluetooth::new()
            .with_bonded("00:11:62:00:00:01", "Printer1")
            .with_nearby("00:11:62:00:00:02", "Printer2")
            .with_nearby("00:11:62:00:00:03", "Printer3")
    }

    fn registry(
        sim: &SimulatedBluetooth,
        permissions: StaticPermissions,
    ) -> (Arc<DeviceRegistry>, watch::Sender<RadioState>) {
        let (radio_tx, radio_rx) = watch::channel(RadioState::On);
        let registry = DeviceRegistry::new(Arc::new(sim.clone()), Arc::new(permissions), radio_rx);
        (Arc::new(registry), radio_tx)
    }

    fn ids(devices: &[Device]) -> Vec<&str> {
        devices.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_refresh_bonded() {
        let sim = sim();
        let (registry, _radio) = registry(&sim, StaticPermissions::all_granted());
        assert!(registry.list_bonded().is_empty());

        let bonded = registry.refresh_bonded().await.unwrap();
        assert_eq!(ids(&bonded), vec!["00:11:62:00:00:01"]);
        assert_eq!(bonded[0].bond_state, BondState::Bonded);
        assert_eq!(registry.find("00:11:62:00:00:01").unwrap().display_name, "Printer1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_accumulates_until_timeout() {
        let sim = sim();
        let (registry, _radio) = registry(&sim, StaticPermissions::all_granted());

        let found = registry.start_scan(Duration::from_secs(30)).await.unwrap();
        assert_eq!(ids(&found), vec!["00:11:62:00:00:02", "00:11:62:00:00:03"]);
        assert!(found.iter().all(|d| d.bond_state == BondState::Discovered));
        assert!(!registry.is_scanning());
        assert!(!sim.is_discovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_scan_rejected() {
        let sim = sim();
        let (registry, _radio) = registry(&sim, StaticPermissions::all_granted());

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start_scan(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = registry.start_scan(Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, CounterprintError::ScanInProgress));

        assert!(registry.cancel_scan());
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_scan_is_idempotent() {
        let sim = sim();
        let (registry, _radio) = registry(&sim, StaticPermissions::all_granted());
        assert!(!registry.cancel_scan());
        assert!(!registry.cancel_scan());
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_force_cancels_scan() {
        let sim = sim();
        sim.set_discovery_interval(Duration::from_millis(100));
        let (registry, radio) = registry(&sim, StaticPermissions::all_granted());
        let mut available = registry.watch_available();

        let scan = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start_scan(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(registry.available().len(), 2);

        radio.send_replace(RadioState::Off);
        registry.handle_radio_state(RadioState::Off);
        assert!(registry.available().is_empty());
        assert!(available.borrow_and_update().is_empty());

        // The scan resolves normally, with nothing available
        let result = scan.await.unwrap().unwrap();
        assert!(result.is_empty());
        assert!(!registry.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_requires_radio_on() {
        let sim = sim();
        let (registry, radio) = registry(&sim, StaticPermissions::all_granted());
        radio.send_replace(RadioState::Off);

        let err = registry.start_scan(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CounterprintError::Radio(_)));
        assert!(!registry.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_permission_denied() {
        let sim = sim();
        let (registry, _radio) = registry(&sim, StaticPermissions::denying([Permission::BluetoothScan]));

        let err = registry.start_scan(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CounterprintError::PermissionDenied(_)));
        assert!(!sim.is_discovering());
    }

    #[tokio::test]
    async fn test_radio_off_clears_bonded() {
        let sim = sim();
        let (registry, radio) = registry(&sim, StaticPermissions::all_granted());
        registry.refresh_bonded().await.unwrap();

        radio.send_replace(RadioState::Transitioning);
        registry.handle_radio_state(RadioState::Transitioning);
        assert_eq!(registry.list_bonded().len(), 1);

        radio.send_replace(RadioState::Off);
        registry.handle_radio_state(RadioState::Off);
        assert!(registry.list_bonded().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_right_after_cancel_runs_full_window() {
        let sim = sim();
        let (registry, _radio) = registry(&sim, StaticPermissions::all_granted());

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start_scan(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.cancel_scan());

        let started = tokio::time::Instant::now();
        let second = registry.start_scan(Duration::from_secs(30)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(ids(&second), vec!["00:11:62:00:00:02", "00:11:62:00:00:03"]);

        assert!(first.await.unwrap().unwrap().len() <= 2);
        assert!(!sim.is_discovering());
    }
}
