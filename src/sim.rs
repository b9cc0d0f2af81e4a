//! # Simulated Bluetooth Stack
//!
//! An in-memory radio, scanner and printer that behaves like the real thing
//! closely enough to drive a whole [`PrintStation`](crate::station::PrintStation):
//! toggles take time, discovery trickles devices in, links can be lost when
//! the radio goes off, and every write is recorded.
//!
//! Used by the test suite and by `counterprint --simulate`.
//!
//! ```
//! use counterprint::sim::SimulatedBluetooth;
//!
//! let sim = SimulatedBluetooth::new()
//!     .with_bonded("00:11:62:00:00:01", "Star TSP650II")
//!     .with_nearby("00:11:62:00:00:02", "Receipt Printer 2");
//! assert_eq!(sim.write_count(), 0);
//! ```

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CounterprintError, Result};
use crate::lock;
use crate::permissions::StaticPermissions;
use crate::radio::{RadioAdapter, RadioState};
use crate::registry::{Device, DeviceScanner, Discovery};
use crate::station::Backend;
use crate::transport::{LinkConnector, PrinterLink};

/// One `write_all` call as seen by the simulated printer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub device_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    powered: bool,
    toggle_delay: Duration,
    deny_toggles: bool,
    bonded: Vec<Device>,
    nearby: Vec<Device>,
    discovery_interval: Duration,
    discovery_sessions: usize,
    connect_delay: Duration,
    unreachable: HashSet<String>,
    write_delay: Duration,
    fail_writes: bool,
    writes: Vec<WriteRecord>,
    open_links: usize,
    radio_events: Option<mpsc::UnboundedSender<RadioState>>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            powered: true,
            toggle_delay: Duration::from_millis(200),
            deny_toggles: false,
            bonded: Vec::new(),
            nearby: Vec::new(),
            discovery_interval: Duration::from_millis(50),
            discovery_sessions: 0,
            connect_delay: Duration::from_millis(20),
            unreachable: HashSet::new(),
            write_delay: Duration::from_millis(10),
            fail_writes: false,
            writes: Vec::new(),
            open_links: 0,
            radio_events: None,
        }
    }
}

impl SimState {
    fn emit(&self) {
        let state = if self.powered { RadioState::On } else { RadioState::Off };
        if let Some(events) = &self.radio_events {
            let _ = events.send(state);
        }
    }
}

/// Shared handle to one simulated host. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBluetooth {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBluetooth {
    /// A powered-on host with no known devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a paired device.
    pub fn with_bonded(self, id: &str, name: &str) -> Self {
        lock(&self.state).bonded.push(Device::bonded(id, name));
        self
    }

    /// Add a device that discovery will find.
    pub fn with_nearby(self, id: &str, name: &str) -> Self {
        lock(&self.state).nearby.push(Device::discovered(id, name));
        self
    }

    pub fn set_toggle_delay(&self, delay: Duration) {
        lock(&self.state).toggle_delay = delay;
    }

    /// Make `set_powered` fail as if the OS refused.
    pub fn deny_toggles(&self, deny: bool) {
        lock(&self.state).deny_toggles = deny;
    }

    pub fn set_discovery_interval(&self, interval: Duration) {
        lock(&self.state).discovery_interval = interval;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    /// Make connection attempts to `id` fail.
    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        let mut state = lock(&self.state);
        if unreachable {
            state.unreachable.insert(id.to_string());
        } else {
            state.unreachable.remove(id);
        }
    }

    pub fn set_write_delay(&self, delay: Duration) {
        lock(&self.state).write_delay = delay;
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Flip the radio as if the user did it outside this process.
    pub fn power_externally(&self, powered: bool) {
        let mut state = lock(&self.state);
        state.powered = powered;
        state.emit();
    }

    /// Channel of OS radio events. Replaces any earlier channel.
    pub fn radio_events(&self) -> mpsc::UnboundedReceiver<RadioState> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).radio_events = Some(tx);
        rx
    }

    /// Everything written so far, in call order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.state).writes.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).writes.len()
    }

    pub fn is_discovering(&self) -> bool {
        lock(&self.state).discovery_sessions > 0
    }

    /// Links opened and not yet closed
    pub fn open_links(&self) -> usize {
        lock(&self.state).open_links
    }

    /// A station backend with every permission granted.
    pub fn backend(&self) -> Backend {
        Backend {
            radio: Arc::new(self.clone()),
            scanner: Arc::new(self.clone()),
            connector: Arc::new(self.clone()),
            permissions: Arc::new(StaticPermissions::all_granted()),
            radio_events: Some(self.radio_events()),
        }
    }

    fn ensure_powered(&self) -> Result<()> {
        if lock(&self.state).powered {
            Ok(())
        } else {
            Err(CounterprintError::Radio("Bluetooth radio is off".into()))
        }
    }
}

#[async_trait]
impl RadioAdapter for SimulatedBluetooth {
    async fn power_state(&self) -> Result<RadioState> {
        Ok(if lock(&self.state).powered {
            RadioState::On
        } else {
            RadioState::Off
        })
    }

    async fn set_powered(&self, powered: bool) -> Result<()> {
        let delay = {
            let state = lock(&self.state);
            if state.deny_toggles {
                return Err(CounterprintError::PermissionDenied(
                    "radio toggle refused by the OS".into(),
                ));
            }
            state.toggle_delay
        };

        tokio::time::sleep(delay).await;

        let mut state = lock(&self.state);
        state.powered = powered;
        state.emit();
        Ok(())
    }
}

#[async_trait]
impl DeviceScanner for SimulatedBluetooth {
    async fn bonded_devices(&self) -> Result<Vec<Device>> {
        self.ensure_powered()?;
        Ok(lock(&self.state).bonded.clone())
    }

    async fn start_discovery(&self) -> Result<Discovery> {
        self.ensure_powered()?;

        let (found_tx, found_rx) = mpsc::unbounded_channel();
        let (nearby, interval) = {
            let mut state = lock(&self.state);
            state.discovery_sessions += 1;
            (state.nearby.clone(), state.discovery_interval)
        };

        let task = tokio::spawn(async move {
            for device in nearby {
                tokio::time::sleep(interval).await;
                if found_tx.send(device).is_err() {
                    return;
                }
            }
            // Keep the channel open until the session is dropped
            std::future::pending::<()>().await;
        });

        let state = self.state.clone();
        Ok(Discovery::new(found_rx, move || {
            task.abort();
            let mut state = lock(&state);
            state.discovery_sessions = state.discovery_sessions.saturating_sub(1);
        }))
    }
}

#[async_trait]
impl LinkConnector for SimulatedBluetooth {
    async fn open(&self, device: &Device) -> Result<Box<dyn PrinterLink>> {
        self.ensure_powered()?;
        let delay = lock(&self.state).connect_delay;
        tokio::time::sleep(delay).await;

        let mut state = lock(&self.state);
        if !state.powered {
            return Err(CounterprintError::Transport("Bluetooth radio went off".into()));
        }
        if state.unreachable.contains(&device.id) {
            return Err(CounterprintError::Transport(format!("{} is not reachable", device.id)));
        }
        state.open_links += 1;
        debug!("Simulated link to {} opened", device.id);

        Ok(Box::new(SimLink {
            device_id: device.id.clone(),
            state: self.state.clone(),
        }))
    }
}

#[derive(Debug)]
struct SimLink {
    device_id: String,
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl PrinterLink for SimLink {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let delay = {
            let mut state = lock(&self.state);
            state.writes.push(WriteRecord {
                device_id: self.device_id.clone(),
                payload: data.to_vec(),
            });
            state.write_delay
        };

        tokio::time::sleep(delay).await;

        let state = lock(&self.state);
        if !state.powered {
            Err(CounterprintError::Transport("Link lost: radio powered off".into()))
        } else if state.fail_writes {
            Err(CounterprintError::Transport("Write failed: printer not responding".into()))
        } else {
            Ok(())
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_links = state.open_links.saturating_sub(1);
        debug!("Simulated link to {} closed", self.device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_toggle_emits_event() {
        let sim = SimulatedBluetooth::new();
        let mut events = sim.radio_events();

        sim.set_powered(false).await.unwrap();
        assert_eq!(events.recv().await, Some(RadioState::Off));
        assert_eq!(sim.power_state().await.unwrap(), RadioState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_trickles_devices() {
        let sim = SimulatedBluetooth::new()
            .with_nearby("00:00:00:00:00:01", "A")
            .with_nearby("00:00:00:00:00:02", "B");

        let mut found = sim.start_discovery().await.unwrap();
        assert!(sim.is_discovering());
        assert_eq!(found.next().await.unwrap().display_name, "A");
        assert_eq!(found.next().await.unwrap().display_name, "B");

        drop(found);
        assert!(!sim.is_discovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_sessions_are_independent() {
        let sim = SimulatedBluetooth::new().with_nearby("00:00:00:00:00:01", "A");

        let first = sim.start_discovery().await.unwrap();
        let mut second = sim.start_discovery().await.unwrap();
        drop(first);

        assert!(sim.is_discovering());
        assert_eq!(second.next().await.unwrap().display_name, "A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_are_recorded_and_fail_when_unpowered() {
        let sim = SimulatedBluetooth::new();
        let device = Device::bonded("00:00:00:00:00:01", "A");
        let mut link = sim.open(&device).await.unwrap();
        assert_eq!(sim.open_links(), 1);

        link.write_all(b"one").await.unwrap();
        sim.power_externally(false);
        let err = link.write_all(b"two").await.unwrap_err();
        assert!(matches!(err, CounterprintError::Transport(_)));

        let payloads: Vec<Vec<u8>> = sim.writes().into_iter().map(|w| w.payload).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);

        link.close().await.unwrap();
        assert_eq!(sim.open_links(), 0);
    }

    #[tokio::test]
    async fn test_unpowered_host_refuses_work() {
        let sim = SimulatedBluetooth::new().with_bonded("00:00:00:00:00:01", "A");
        sim.power_externally(false);
        assert!(sim.bonded_devices().await.is_err());
        assert!(sim.start_discovery().await.is_err());
    }
}
