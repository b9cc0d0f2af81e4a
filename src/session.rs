//! # Connection Session
//!
//! The one printer connection a station may hold.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──transport ack──▶ Connected
//! Connected ──disconnect()──▶ Disconnecting ──▶ Disconnected
//! any ──transport error──▶ Failed ──▶ Disconnected
//! any ──radio Off──▶ Disconnected
//! ```
//!
//! `Failed` holds while the broken link is closed, and watchers get a turn to
//! read it before the session settles to `Disconnected`. The reason stays in
//! [`SessionSnapshot::last_error`] afterwards. Both happen before the failing
//! call returns.
//!
//! Every successful `connect` starts a new *generation*. The print serializer
//! captures the generation of the link it writes to and watches for it to
//! change, which is how a disconnect or radio-off reaches an in-flight job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{CounterprintError, Result};
use crate::lock;
use crate::permissions::{self, PermissionGate, BLUETOOTH_PERMISSIONS};
use crate::radio::RadioState;
use crate::registry::Device;
use crate::transport::{LinkConnector, PrinterLink};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Read-only view of the session, as published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Target device; `None` once disconnected
    pub device: Option<Device>,
    pub state: SessionState,
    /// Set when the session reached `Connected`
    pub established_at: Option<DateTime<Utc>>,
    /// Why the last attempt or link ended, if it ended badly
    pub last_error: Option<String>,
    pub generation: u64,
}

impl SessionSnapshot {
    fn disconnected(generation: u64, last_error: Option<String>) -> Self {
        Self {
            device: None,
            state: SessionState::Disconnected,
            established_at: None,
            last_error,
            generation,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

/// A link shared between the session (which closes it) and the serializer
/// (which writes to it). Whoever takes the box out owns the teardown.
pub(crate) type SharedLink = Arc<tokio::sync::Mutex<Option<Box<dyn PrinterLink>>>>;

/// The live link of one connected generation
#[derive(Debug, Clone)]
pub(crate) struct ActiveLink {
    pub generation: u64,
    pub device: Device,
    pub link: SharedLink,
}

#[derive(Debug, Default)]
struct Inner {
    link: Option<ActiveLink>,
    last_device: Option<Device>,
}

/// Owns connect, disconnect and reconnect transitions
#[derive(Debug)]
pub struct ConnectionSession {
    connector: Arc<dyn LinkConnector>,
    permissions: Arc<dyn PermissionGate>,
    radio: watch::Receiver<RadioState>,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionSnapshot>,
}

impl ConnectionSession {
    pub fn new(
        connector: Arc<dyn LinkConnector>,
        permissions: Arc<dyn PermissionGate>,
        radio: watch::Receiver<RadioState>,
        connect_timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot::disconnected(0, None));
        Self {
            connector,
            permissions,
            radio,
            connect_timeout,
            inner: Mutex::new(Inner::default()),
            state_tx,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_tx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    /// The device `reconnect` would target
    pub fn last_device(&self) -> Option<Device> {
        lock(&self.inner).last_device.clone()
    }

    /// Connect to `device`.
    ///
    /// Succeeds without doing anything when `device` is already connected.
    ///
    /// ## Errors
    ///
    /// - `AlreadyConnected` when a different device is connected
    /// - `Busy` while another connect or disconnect is in flight
    /// - `ConnectTimeout` when the transport does not answer in time
    /// - `PermissionDenied`, `Radio` (radio not on), `Transport`
    pub async fn connect(&self, device: &Device) -> Result<SessionSnapshot> {
        permissions::require(self.permissions.as_ref(), &BLUETOOTH_PERMISSIONS).await?;

        let generation = {
            let _inner = lock(&self.inner);
            let current = self.snapshot();
            match current.state {
                SessionState::Connected => {
                    if current.device.as_ref().is_some_and(|d| d.id == device.id) {
                        return Ok(current);
                    }
                    let holder = current
                        .device
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "unknown device".into());
                    return Err(CounterprintError::AlreadyConnected(holder));
                }
                SessionState::Connecting | SessionState::Disconnecting => {
                    return Err(CounterprintError::Busy);
                }
                SessionState::Disconnected | SessionState::Failed => {}
            }

            let radio = *self.radio.borrow();
            if radio != RadioState::On {
                return Err(CounterprintError::Radio(format!("Bluetooth radio is {}", radio)));
            }

            let generation = current.generation + 1;
            self.state_tx.send_replace(SessionSnapshot {
                device: Some(device.clone()),
                state: SessionState::Connecting,
                established_at: None,
                last_error: None,
                generation,
            });
            generation
        };

        info!("Connecting to {}", device);
        let opened = match tokio::time::timeout(self.connect_timeout, self.connector.open(device)).await {
            Ok(result) => result,
            Err(_) => Err(CounterprintError::ConnectTimeout(device.id.clone())),
        };

        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                warn!("Connection to {} failed: {}", device, e);
                if self.connect_failed(generation, e.to_string()) {
                    self.settle_failed(generation).await;
                }
                return Err(e);
            }
        };

        let stale = {
            let mut inner = lock(&self.inner);
            let current = self.snapshot();
            if current.generation != generation || current.state != SessionState::Connecting {
                Some(link)
            } else {
                inner.link = Some(ActiveLink {
                    generation,
                    device: device.clone(),
                    link: Arc::new(tokio::sync::Mutex::new(Some(link))),
                });
                inner.last_device = Some(device.clone());
                self.state_tx.send_replace(SessionSnapshot {
                    state: SessionState::Connected,
                    established_at: Some(Utc::now()),
                    ..current
                });
                None
            }
        };

        if let Some(link) = stale {
            debug!("Connect to {} was interrupted; closing fresh link", device);
            if let Err(e) = link.close().await {
                warn!("Failed to close interrupted link: {}", e);
            }
            return Err(CounterprintError::Transport("Connection interrupted".into()));
        }

        info!("Connected to {}", device);
        Ok(self.snapshot())
    }

    /// Tear down the link. Safe to call in any state.
    ///
    /// A connect still in flight is abandoned; its link is closed as soon as
    /// the transport hands it over.
    pub async fn disconnect(&self) -> Result<()> {
        let (generation, active) = {
            let mut inner = lock(&self.inner);
            let current = self.snapshot();
            match current.state {
                SessionState::Disconnected | SessionState::Disconnecting | SessionState::Failed => {
                    debug!("Disconnect ignored; session is {}", current.state);
                    return Ok(());
                }
                SessionState::Connecting => {
                    info!("Abandoning connection attempt");
                    self.state_tx
                        .send_replace(SessionSnapshot::disconnected(current.generation, None));
                    return Ok(());
                }
                SessionState::Connected => {}
            }

            self.state_tx.send_replace(SessionSnapshot {
                state: SessionState::Disconnecting,
                ..current.clone()
            });
            (current.generation, inner.link.take())
        };

        if let Some(active) = active {
            info!("Disconnecting from {}", active.device);
            close_link(active.link).await;
        }

        let _inner = lock(&self.inner);
        let current = self.snapshot();
        if current.generation == generation && current.state == SessionState::Disconnecting {
            self.state_tx
                .send_replace(SessionSnapshot::disconnected(generation, None));
        }
        Ok(())
    }

    /// Connect to the last connected device. One attempt, no retry.
    pub async fn reconnect(&self) -> Result<SessionSnapshot> {
        let device = self.last_device().ok_or(CounterprintError::NoPriorDevice)?;
        info!("Reconnecting to {}", device);
        self.connect(&device).await
    }

    /// React to a radio transition. `Off` drops the link exactly like an
    /// explicit disconnect. `Transitioning` leaves it alone: a toggle the OS
    /// refuses never turns the radio off.
    pub fn handle_radio_state(&self, state: RadioState) {
        if state != RadioState::Off {
            return;
        }

        let active = {
            let mut inner = lock(&self.inner);
            let current = self.snapshot();
            if current.state == SessionState::Disconnected {
                return;
            }
            info!("Radio is {}; dropping {} session", state, current.state);
            self.state_tx.send_replace(SessionSnapshot::disconnected(
                current.generation,
                Some("Bluetooth radio powered off".into()),
            ));
            inner.link.take()
        };

        if let Some(active) = active {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(close_link(active.link));
                }
                Err(_) => debug!("No runtime; dropping link to {} unclosed", active.device),
            }
        }
    }

    /// The link of the current generation, if connected.
    pub(crate) fn active_link(&self) -> Option<ActiveLink> {
        let inner = lock(&self.inner);
        let current = self.snapshot();
        inner
            .link
            .clone()
            .filter(|active| current.is_connected() && active.generation == current.generation)
    }

    /// Resolves once `generation` is no longer the connected generation.
    pub(crate) async fn link_lost(&self, generation: u64) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx
            .wait_for(|snapshot| !(snapshot.is_connected() && snapshot.generation == generation))
            .await;
    }

    /// Report a write failure on `generation`: publish `Failed`, close the
    /// link, then settle to `Disconnected`. Ignored if that generation is gone.
    pub(crate) async fn transport_failed(&self, generation: u64, reason: String) {
        let active = {
            let mut inner = lock(&self.inner);
            let current = self.snapshot();
            if current.generation != generation || !current.is_connected() {
                return;
            }
            warn!("Link to printer failed: {}", reason);
            self.state_tx.send_replace(SessionSnapshot {
                state: SessionState::Failed,
                last_error: Some(reason.clone()),
                ..current
            });
            inner.link.take()
        };

        if let Some(active) = active {
            close_link(active.link).await;
        }
        self.settle_failed(generation).await;
    }

    /// Publish `Failed` for a connection attempt that did not complete.
    fn connect_failed(&self, generation: u64, reason: String) -> bool {
        let _inner = lock(&self.inner);
        let current = self.snapshot();
        if current.generation != generation || current.state != SessionState::Connecting {
            return false;
        }
        self.state_tx.send_replace(SessionSnapshot {
            state: SessionState::Failed,
            last_error: Some(reason),
            ..current
        });
        true
    }

    /// Move `generation` from `Failed` to `Disconnected`, keeping the reason.
    ///
    /// Observers get a turn to read `Failed` first.
    async fn settle_failed(&self, generation: u64) {
        tokio::task::yield_now().await;

        let _inner = lock(&self.inner);
        let current = self.snapshot();
        if current.generation == generation && current.state == SessionState::Failed {
            self.state_tx.send_replace(SessionSnapshot::disconnected(
                generation,
                current.last_error,
            ));
        }
    }
}

async fn close_link(link: SharedLink) {
    let taken = link.lock().await.take();
    if let Some(link) = taken
        && let Err(e) = link.close().await
    {
        warn!("Failed to close printer link: {}", e);
    }
}
