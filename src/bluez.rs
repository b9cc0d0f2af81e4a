//! # BlueZ Backend
//!
//! Radio control and device discovery on Linux, over the BlueZ D-Bus API.
//! Printer links go through RFCOMM device nodes, see
//! [`transport::rfcomm`](crate::transport::rfcomm).
//!
//! | Operation | BlueZ |
//! |-----------|-------|
//! | power state | `Adapter1.Powered` |
//! | toggle | set `Adapter1.Powered` |
//! | radio events | `Powered` changes on the adapter event stream |
//! | bonded list | known devices with `Device1.Paired` |
//! | discovery | `StartDiscovery`, stopped when the session's stream is dropped |
//!
//! Requires a running `bluetoothd`.

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, ErrorKind, Session};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::StationConfig;
use crate::error::{CounterprintError, Result};
use crate::permissions::StaticPermissions;
use crate::radio::{RadioAdapter, RadioState};
use crate::registry::{Device, DeviceScanner, Discovery};
use crate::station::Backend;
use crate::transport::RfcommConnector;

/// One BlueZ controller
#[derive(Clone)]
pub struct BluezAdapter {
    adapter: Adapter,
}

impl BluezAdapter {
    /// Connect to `bluetoothd` and pick the adapter called `name`, or the
    /// default adapter.
    pub async fn open(name: Option<&str>) -> Result<Self> {
        let session = Session::new().await.map_err(radio_error)?;
        let adapter = match name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(radio_error)?;

        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(Self { adapter })
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    /// Power changes reported by BlueZ, until the receiver is dropped.
    pub async fn power_events(&self) -> Result<mpsc::UnboundedReceiver<RadioState>> {
        let events = self.adapter.events().await.map_err(radio_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let name = self.adapter.name().to_string();

        tokio::spawn(async move {
            tokio::pin!(events);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered))) => {
                            if tx.send(power_state(powered)).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("Stopped following power events on {}", name);
        });

        Ok(rx)
    }
}

impl fmt::Debug for BluezAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluezAdapter")
            .field("name", &self.adapter.name())
            .finish()
    }
}

#[async_trait]
impl RadioAdapter for BluezAdapter {
    async fn power_state(&self) -> Result<RadioState> {
        let powered = self.adapter.is_powered().await.map_err(radio_error)?;
        Ok(power_state(powered))
    }

    async fn set_powered(&self, powered: bool) -> Result<()> {
        self.adapter
            .set_powered(powered)
            .await
            .map_err(|e| toggle_error(&e.kind, &e.message))
    }
}

#[async_trait]
impl DeviceScanner for BluezAdapter {
    async fn bonded_devices(&self) -> Result<Vec<Device>> {
        let mut bonded = Vec::new();
        for address in self.adapter.device_addresses().await.map_err(radio_error)? {
            let device = self.adapter.device(address).map_err(radio_error)?;
            if device.is_paired().await.unwrap_or(false) {
                bonded.push(Device::bonded(address.to_string(), display_name(&device, address).await));
            }
        }
        Ok(bonded)
    }

    async fn start_discovery(&self) -> Result<Discovery> {
        let events = self.adapter.discover_devices().await.map_err(radio_error)?;
        let adapter = self.adapter.clone();
        let (found_tx, found_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            tokio::pin!(events);
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let name = match adapter.device(address) {
                    Ok(device) => display_name(&device, address).await,
                    Err(_) => address.to_string(),
                };
                if found_tx.send(Device::discovered(address.to_string(), name)).is_err() {
                    break;
                }
            }
            debug!("Discovery stream on {} ended", adapter.name());
        });

        info!("BlueZ discovery started on {}", self.adapter.name());
        Ok(Discovery::new(found_rx, move || task.abort()))
    }
}

/// Linux backend: BlueZ radio and discovery, RFCOMM printer links.
pub async fn backend(config: &StationConfig) -> Result<Backend> {
    let adapter = BluezAdapter::open(config.adapter.as_deref()).await?;
    let radio_events = adapter.power_events().await?;

    Ok(Backend {
        radio: Arc::new(adapter.clone()),
        scanner: Arc::new(adapter),
        connector: Arc::new(RfcommConnector::new(config.rfcomm.clone())),
        permissions: Arc::new(StaticPermissions::all_granted()),
        radio_events: Some(radio_events),
    })
}

async fn display_name(device: &bluer::Device, address: Address) -> String {
    device
        .name()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| address.to_string())
}

fn power_state(powered: bool) -> RadioState {
    if powered { RadioState::On } else { RadioState::Off }
}

fn radio_error(e: bluer::Error) -> CounterprintError {
    CounterprintError::Radio(format!("BlueZ: {}", e))
}

/// A refused power change is a permission problem; anything else is the radio's.
fn toggle_error(kind: &ErrorKind, message: &str) -> CounterprintError {
    match kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
            CounterprintError::PermissionDenied(format!("Radio toggle refused: {}", message))
        }
        _ => CounterprintError::Radio(format!("Radio toggle failed ({:?}): {}", kind, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_power_state() {
        assert_eq!(power_state(true), RadioState::On);
        assert_eq!(power_state(false), RadioState::Off);
    }

    #[test]
    fn test_refused_toggle_is_permission_denied() {
        let err = toggle_error(&ErrorKind::NotAuthorized, "rfkill");
        assert!(matches!(err, CounterprintError::PermissionDenied(msg) if msg.contains("rfkill")));
        let err = toggle_error(&ErrorKind::NotPermitted, "policy");
        assert!(matches!(err, CounterprintError::PermissionDenied(_)));
    }

    #[test]
    fn test_other_toggle_failures_are_radio_errors() {
        let err = toggle_error(&ErrorKind::NotReady, "adapter not ready");
        assert!(matches!(err, CounterprintError::Radio(msg) if msg.contains("NotReady")));
        let err = toggle_error(&ErrorKind::Failed, "busy");
        assert!(matches!(err, CounterprintError::Radio(_)));
    }

    // Talking to bluetoothd requires a host with BlueZ and is exercised manually.
}
