//! # Radio State Monitor
//!
//! Tracks whether the host Bluetooth radio is powered and tells the rest of
//! the station when that changes.
//!
//! ## Transitions
//!
//! OS events arrive through [`RadioStateMonitor::observe`] (directly, or via
//! [`RadioStateMonitor::follow`] pumping an event channel). Repeated identical
//! states are dropped, so listeners only see confirmed transitions:
//!
//! ```text
//! Off ──enable()──▶ Transitioning ──OS ack──▶ On
//! On ──disable()──▶ Transitioning ──OS ack──▶ Off
//! ```
//!
//! ## Listeners
//!
//! [`RadioStateMonitor::on_change`] listeners run synchronously inside
//! `observe`, in registration order, so a dependant (device lists, the printer
//! session) has reacted before `observe` returns. A listener must not call
//! back into `observe`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CounterprintError, Result};
use crate::lock;

/// Power state of the host Bluetooth radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioState {
    Off,
    On,
    Transitioning,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Off => write!(f, "off"),
            RadioState::On => write!(f, "on"),
            RadioState::Transitioning => write!(f, "transitioning"),
        }
    }
}

/// OS-level control over the radio
#[async_trait]
pub trait RadioAdapter: Send + Sync + Debug {
    /// Read the current power state
    async fn power_state(&self) -> Result<RadioState>;

    /// Request a power change, resolving once the OS has applied it
    async fn set_powered(&self, powered: bool) -> Result<()>;
}

type Listener = Arc<dyn Fn(RadioState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Handle returned by [`RadioStateMonitor::on_change`].
///
/// Dropping it removes the listener.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Watches the radio and serializes toggle requests
pub struct RadioStateMonitor {
    adapter: Arc<dyn RadioAdapter>,
    state_tx: watch::Sender<RadioState>,
    listeners: Arc<Mutex<Listeners>>,
    observe_lock: Mutex<()>,
    toggling: AtomicBool,
    toggle_timeout: Duration,
}

/// Clears the in-flight flag when a toggle finishes, however it finishes.
struct ToggleGuard<'a>(&'a AtomicBool);

impl Drop for ToggleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RadioStateMonitor {
    /// Create a monitor. The state starts as `Off` until [`refresh`](Self::refresh)
    /// or an OS event says otherwise.
    pub fn new(adapter: Arc<dyn RadioAdapter>, toggle_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(RadioState::Off);
        Self {
            adapter,
            state_tx,
            listeners: Arc::new(Mutex::new(Listeners::default())),
            observe_lock: Mutex::new(()),
            toggling: AtomicBool::new(false),
            toggle_timeout,
        }
    }

    /// Current radio state
    pub fn state(&self) -> RadioState {
        *self.state_tx.borrow()
    }

    /// True while an `enable`/`disable` request is in flight
    pub fn is_toggling(&self) -> bool {
        self.toggling.load(Ordering::Acquire)
    }

    /// Receiver that always holds the latest state, for display.
    pub fn watch(&self) -> watch::Receiver<RadioState> {
        self.state_tx.subscribe()
    }

    /// Register a listener for confirmed transitions.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(RadioState) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Feed an OS-reported state. Returns `false` when it repeats the
    /// current state and was dropped.
    pub fn observe(&self, state: RadioState) -> bool {
        let _serial = lock(&self.observe_lock);

        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if !changed {
            debug!("Ignoring repeated radio state {}", state);
            return false;
        }

        info!("Bluetooth radio is now {}", state);
        let listeners: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(state);
        }
        true
    }

    /// Ask the adapter for its state and observe it.
    pub async fn refresh(&self) -> Result<RadioState> {
        let state = tokio::time::timeout(self.toggle_timeout, self.adapter.power_state())
            .await
            .map_err(|_| {
                CounterprintError::Radio(format!(
                    "Timed out reading radio state after {:?}",
                    self.toggle_timeout
                ))
            })??;
        self.observe(state);
        Ok(state)
    }

    /// Pump OS radio events into [`observe`](Self::observe) until the
    /// sender side closes.
    pub fn follow(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<RadioState>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(state) = events.recv().await {
                monitor.observe(state);
            }
            debug!("Radio event stream closed");
        })
    }

    /// Power the radio on.
    pub async fn enable(&self) -> Result<()> {
        self.toggle(true).await
    }

    /// Power the radio off.
    pub async fn disable(&self) -> Result<()> {
        self.toggle(false).await
    }

    async fn toggle(&self, powered: bool) -> Result<()> {
        if self.toggling.swap(true, Ordering::AcqRel) {
            return Err(CounterprintError::Busy);
        }
        let _guard = ToggleGuard(&self.toggling);

        let target = if powered { RadioState::On } else { RadioState::Off };
        if self.state() == target {
            debug!("Radio already {}", target);
            return Ok(());
        }

        info!("Turning Bluetooth radio {}", target);
        self.observe(RadioState::Transitioning);

        let result = tokio::time::timeout(self.toggle_timeout, self.adapter.set_powered(powered)).await;
        match result {
            Ok(Ok(())) => {
                self.observe(target);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Radio toggle to {} failed: {}", target, e);
                self.settle().await;
                Err(match e {
                    CounterprintError::Radio(_) => e,
                    other => CounterprintError::Radio(other.to_string()),
                })
            }
            Err(_) => {
                warn!("Radio toggle to {} timed out", target);
                self.settle().await;
                Err(CounterprintError::Radio(format!(
                    "Timed out turning radio {} after {:?}",
                    target, self.toggle_timeout
                )))
            }
        }
    }

    /// After a failed toggle, fall back to whatever the adapter reports.
    async fn settle(&self) {
        if let Err(e) = self.refresh().await {
            warn!("Could not re-read radio state: {}", e);
        }
    }
}

impl Debug for RadioStateMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadioStateMonitor")
            .field("state", &self.state())
            .field("toggling", &self.is_toggling())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBluetooth;
    use pretty_assertions::assert_eq;

    fn monitor(sim: &SimulatedBluetooth) -> Arc<RadioStateMonitor> {
        Arc::new(RadioStateMonitor::new(Arc::new(sim.clone()), Duration::from_secs(10)))
    }

    fn recorder(monitor: &RadioStateMonitor) -> (Arc<Mutex<Vec<RadioState>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = monitor.on_change(move |state| sink.lock().unwrap().push(state));
        (seen, subscription)
    }

    #[tokio::test]
    async fn test_duplicate_states_are_debounced() {
        let sim = SimulatedBluetooth::new();
        let monitor = monitor(&sim);
        let (seen, _sub) = recorder(&monitor);

        assert!(monitor.observe(RadioState::On));
        assert!(!monitor.observe(RadioState::On));
        assert!(monitor.observe(RadioState::Off));
        assert!(!monitor.observe(RadioState::Off));

        assert_eq!(*seen.lock().unwrap(), vec![RadioState::On, RadioState::Off]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let sim = SimulatedBluetooth::new();
        let monitor = monitor(&sim);
        let (seen, sub) = recorder(&monitor);

        monitor.observe(RadioState::On);
        sub.unsubscribe();
        monitor.observe(RadioState::Off);

        assert_eq!(*seen.lock().unwrap(), vec![RadioState::On]);
    }

    #[tokio::test]
    async fn test_refresh_reads_adapter() {
        let sim = SimulatedBluetooth::new();
        let monitor = monitor(&sim);
        assert_eq!(monitor.state(), RadioState::Off);
        assert_eq!(monitor.refresh().await.unwrap(), RadioState::On);
        assert_eq!(monitor.state(), RadioState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_passes_through_transitioning() {
        let sim = SimulatedBluetooth::new();
        sim.power_externally(false);
        let monitor = monitor(&sim);
        let (seen, _sub) = recorder(&monitor);

        monitor.enable().await.unwrap();

        assert_eq!(monitor.state(), RadioState::On);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![RadioState::Transitioning, RadioState::On]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_toggle_is_busy() {
        let sim = SimulatedBluetooth::new();
        sim.set_toggle_delay(Duration::from_secs(3));
        let monitor = monitor(&sim);
        monitor.refresh().await.unwrap();

        let first = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.disable().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(monitor.is_toggling());

        let err = monitor.enable().await.unwrap_err();
        assert!(matches!(err, CounterprintError::Busy));

        first.await.unwrap().unwrap();
        assert_eq!(monitor.state(), RadioState::Off);
        assert!(!monitor.is_toggling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_timeout_is_radio_error() {
        let sim = SimulatedBluetooth::new();
        sim.set_toggle_delay(Duration::from_secs(30));
        let monitor = monitor(&sim);
        monitor.refresh().await.unwrap();

        let err = monitor.disable().await.unwrap_err();
        assert!(matches!(err, CounterprintError::Radio(msg) if msg.contains("Timed out")));
        // The adapter never applied the change
        assert_eq!(monitor.state(), RadioState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_toggle_is_radio_error() {
        let sim = SimulatedBluetooth::new();
        sim.deny_toggles(true);
        let monitor = monitor(&sim);
        monitor.refresh().await.unwrap();

        let err = monitor.disable().await.unwrap_err();
        assert!(matches!(err, CounterprintError::Radio(_)));
        assert_eq!(monitor.state(), RadioState::On);
    }

    #[tokio::test]
    async fn test_toggle_to_current_state_is_noop() {
        let sim = SimulatedBluetooth::new();
        let monitor = monitor(&sim);
        monitor.refresh().await.unwrap();
        let (seen, _sub) = recorder(&monitor);

        monitor.enable().await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_follow_pumps_os_events() {
        let sim = SimulatedBluetooth::new();
        let monitor = monitor(&sim);
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = monitor.follow(rx);

        tx.send(RadioState::On).unwrap();
        tx.send(RadioState::Off).unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(monitor.state(), RadioState::Off);
    }
}
