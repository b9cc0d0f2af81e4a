//! # Print Queue Orchestrator
//!
//! Polls a [`DocumentSource`] on a fixed interval and prints whatever it
//! reports as unprinted, one document at a time, in the order the source
//! lists them.
//!
//! ## Delivery
//!
//! - A printed document is marked printed. If marking fails it stays
//!   unprinted and will print again next cycle (at-least-once).
//! - A failed document stays unprinted and is retried every cycle with no
//!   backoff and no ceiling. Every `warn_after_attempts` consecutive failures
//!   of the same document are escalated to a warning so a dead printer does
//!   not go unnoticed.
//! - `NoPrinterConnected` ends the cycle early; the rest of the batch would
//!   fail the same way.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::StationConfig;
use crate::error::{CounterprintError, Result};
use crate::lock;
use crate::printer::{PrintJob, PrintJobSerializer, PrintOutcome};
use crate::session::{ConnectionSession, SessionState};

/// A pending document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    /// Opaque printer payload
    pub payload: Vec<u8>,
}

impl Document {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// External document backlog
#[async_trait]
pub trait DocumentSource: Send + Sync + Debug {
    /// Documents not yet flagged printed, in print order
    async fn list_unprinted(&self) -> Result<Vec<Document>>;

    async fn mark_printed(&self, document_id: &str) -> Result<()>;
}

/// Result of one polling cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Documents the source reported unprinted
    pub pending: usize,
    pub printed: usize,
    pub failed: usize,
    /// Printed but could not be marked
    pub mark_failures: usize,
}

/// Feeds a document source into the print serializer
#[derive(Debug)]
pub struct PrintQueueOrchestrator {
    source: Arc<dyn DocumentSource>,
    printer: Arc<PrintJobSerializer>,
    session: Arc<ConnectionSession>,
    poll_interval: Duration,
    reconnect_idle_session: bool,
    warn_after_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
    cycle: tokio::sync::Mutex<()>,
}

impl PrintQueueOrchestrator {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        printer: Arc<PrintJobSerializer>,
        session: Arc<ConnectionSession>,
        config: &StationConfig,
    ) -> Self {
        Self {
            source,
            printer,
            session,
            poll_interval: config.poll_interval(),
            reconnect_idle_session: config.reconnect_idle_session,
            warn_after_attempts: config.warn_after_attempts.max(1),
            attempts: Mutex::new(HashMap::new()),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Consecutive failed attempts recorded for a document
    pub fn attempts(&self, document_id: &str) -> u32 {
        lock(&self.attempts).get(document_id).copied().unwrap_or(0)
    }

    /// Run one polling cycle. Cycles never overlap.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let _cycle = self.cycle.lock().await;

        if self.reconnect_idle_session
            && self.session.state() == SessionState::Disconnected
            && let Some(device) = self.session.last_device()
        {
            debug!("Session idle; reconnecting to {}", device);
            if let Err(e) = self.session.reconnect().await {
                debug!("Reconnect failed: {}", e);
            }
        }

        let documents = self.source.list_unprinted().await?;
        lock(&self.attempts).retain(|id, _| documents.iter().any(|document| &document.id == id));

        let mut report = CycleReport {
            pending: documents.len(),
            ..CycleReport::default()
        };
        if documents.is_empty() {
            return Ok(report);
        }
        debug!("{} unprinted document(s)", documents.len());

        for document in documents {
            let attempt = self.attempts(&document.id) + 1;
            let job = PrintJob::new(document.id.clone(), document.payload).with_attempt(attempt);

            match self.printer.submit(job).await {
                PrintOutcome::Succeeded => {
                    lock(&self.attempts).remove(&document.id);
                    report.printed += 1;
                    if let Err(e) = self.source.mark_printed(&document.id).await {
                        // Stays unprinted and will print again next cycle
                        error!("Printed {} but could not mark it printed: {}", document.id, e);
                        report.mark_failures += 1;
                    }
                }
                PrintOutcome::Failed(e) => {
                    lock(&self.attempts).insert(document.id.clone(), attempt);
                    report.failed += 1;
                    if attempt % self.warn_after_attempts == 0 {
                        warn!(
                            "Document {} has failed {} times; still retrying: {}",
                            document.id, attempt, e
                        );
                    } else {
                        info!("Document {} failed (attempt {}): {}", document.id, attempt, e);
                    }
                    if matches!(e, CounterprintError::NoPrinterConnected) {
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Start polling. The first cycle runs immediately.
    pub fn start(self: Arc<Self>) -> OrchestratorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            info!("Print queue polling every {:?}", self.poll_interval);
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.pending > 0 => info!(
                                "Print cycle: {} printed, {} failed of {} pending",
                                report.printed, report.failed, report.pending
                            ),
                            Ok(_) => {}
                            Err(e) => warn!("Could not list unprinted documents: {}", e),
                        }
                    }
                }
            }
            info!("Print queue stopped");
        });

        OrchestratorHandle {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Handle to a running orchestrator. Dropping it stops polling.
#[derive(Debug)]
pub struct OrchestratorHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    /// Stop polling and wait for the current cycle to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Print queue task ended abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::StaticPermissions;
    use crate::radio::RadioState;
    use crate::registry::Device;
    use crate::sim::SimulatedBluetooth;
    use pretty_assertions::assert_eq;
    use tokio::sync::watch;

    /// In-memory backlog with injectable mark failures
    #[derive(Debug, Default)]
    struct MemorySource {
        documents: Mutex<Vec<(Document, bool)>>,
        fail_marks: Mutex<bool>,
    }

    impl MemorySource {
        fn with(ids: &[&str]) -> Self {
            let documents = ids
                .iter()
                .map(|id| (Document::new(*id, format!("receipt {id}")), false))
                .collect();
            Self {
                documents: Mutex::new(documents),
                fail_marks: Mutex::new(false),
            }
        }

        fn withdraw(&self, id: &str) {
            lock(&self.documents).retain(|(doc, _)| doc.id != id);
        }

        fn printed(&self) -> Vec<String> {
            lock(&self.documents)
                .iter()
                .filter(|(_, printed)| *printed)
                .map(|(doc, _)| doc.id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl DocumentSource for MemorySource {
        async fn list_unprinted(&self) -> Result<Vec<Document>> {
            Ok(lock(&self.documents)
                .iter()
                .filter(|(_, printed)| !printed)
                .map(|(doc, _)| doc.clone())
                .collect())
        }

        async fn mark_printed(&self, document_id: &str) -> Result<()> {
            if *lock(&self.fail_marks) {
                return Err(CounterprintError::Io(std::io::Error::other("backlog offline")));
            }
            for (doc, printed) in lock(&self.documents).iter_mut() {
                if doc.id == document_id {
                    *printed = true;
                }
            }
            Ok(())
        }
    }

    struct Rig {
        sim: SimulatedBluetooth,
        session: Arc<ConnectionSession>,
        source: Arc<MemorySource>,
        queue: Arc<PrintQueueOrchestrator>,
        _radio: watch::Sender<RadioState>,
    }

    fn rig(ids: &[&str], config: StationConfig) -> Rig {
        let sim = SimulatedBluetooth::new();
        let (radio, radio_rx) = watch::channel(RadioState::On);
        let session = Arc::new(ConnectionSession::new(
            Arc::new(sim.clone()),
            Arc::new(StaticPermissions::all_granted()),
            radio_rx,
            config.connect_timeout(),
        ));
        let printer = Arc::new(PrintJobSerializer::spawn(session.clone(), config.write_timeout()));
        let source = Arc::new(MemorySource::with(ids));
        let queue = Arc::new(PrintQueueOrchestrator::new(
            source.clone(),
            printer,
            session.clone(),
            &config,
        ));
        Rig {
            sim,
            session,
            source,
            queue,
            _radio: radio,
        }
    }

    fn printer() -> Device {
        Device::bonded("00:11:62:00:00:01", "Printer1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_prints_and_marks_in_order() {
        let rig = rig(&["a", "b", "c"], StationConfig::default());
        rig.session.connect(&printer()).await.unwrap();

        let report = rig.queue.run_once().await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                pending: 3,
                printed: 3,
                failed: 0,
                mark_failures: 0
            }
        );
        assert_eq!(rig.source.printed(), vec!["a", "b", "c"]);

        let payloads: Vec<Vec<u8>> = rig.sim.writes().into_iter().map(|w| w.payload).collect();
        assert_eq!(payloads[0], b"receipt a");
        assert_eq!(payloads[2], b"receipt c");

        // Nothing left to do
        assert_eq!(rig.queue.run_once().await.unwrap().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_printer_ends_cycle_and_counts_attempts() {
        let rig = rig(&["a", "b"], StationConfig::default());

        let report = rig.queue.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.printed, 0);
        assert_eq!(rig.queue.attempts("a"), 1);
        assert_eq!(rig.queue.attempts("b"), 0);

        rig.queue.run_once().await.unwrap();
        assert_eq!(rig.queue.attempts("a"), 2);
        assert_eq!(rig.sim.write_count(), 0);

        // The printer comes back and the backlog drains
        rig.session.connect(&printer()).await.unwrap();
        let report = rig.queue.run_once().await.unwrap();
        assert_eq!(report.printed, 2);
        assert_eq!(rig.queue.attempts("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawn_document_forgets_attempts() {
        let rig = rig(&["a", "b"], StationConfig::default());
        rig.queue.run_once().await.unwrap();
        assert_eq!(rig.queue.attempts("a"), 1);

        rig.source.withdraw("a");
        let report = rig.queue.run_once().await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(rig.queue.attempts("a"), 0);
        assert_eq!(rig.queue.attempts("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_failure_reprints_next_cycle() {
        let rig = rig(&["a"], StationConfig::default());
        rig.session.connect(&printer()).await.unwrap();
        *lock(&rig.source.fail_marks) = true;

        let report = rig.queue.run_once().await.unwrap();
        assert_eq!(report.printed, 1);
        assert_eq!(report.mark_failures, 1);

        *lock(&rig.source.fail_marks) = false;
        rig.queue.run_once().await.unwrap();
        assert_eq!(rig.sim.write_count(), 2);
        assert_eq!(rig.source.printed(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_reconnects_when_enabled() {
        let config = StationConfig {
            reconnect_idle_session: true,
            ..StationConfig::default()
        };
        let rig = rig(&["a"], config);
        rig.session.connect(&printer()).await.unwrap();
        rig.session.disconnect().await.unwrap();

        let report = rig.queue.run_once().await.unwrap();
        assert_eq!(report.printed, 1);
        assert!(rig.session.snapshot().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_polls_until_stopped() {
        let rig = rig(&["a"], StationConfig::default());
        let handle = rig.queue.clone().start();

        // First tick fails: nothing connected
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.queue.attempts("a"), 1);

        rig.session.connect(&printer()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rig.source.printed(), vec!["a"]);

        assert!(handle.is_running());
        handle.stop().await;
    }
}
