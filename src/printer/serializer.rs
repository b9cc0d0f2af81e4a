//! # Print Job Serializer
//!
//! Every print goes through one background worker that drains a FIFO queue,
//! so the worker is the only writer to the printer link and no two payloads
//! ever interleave on the wire.
//!
//! ## Per-job checks
//!
//! Connection state is checked when a job reaches the head of the queue, not
//! when it is submitted:
//!
//! - No connected session: the job fails with `NoPrinterConnected` and the
//!   link is never touched.
//! - The link drops mid-write (disconnect, radio off, write error or write
//!   timeout): the job fails with a transport error. A write error or timeout
//!   also tears the session down.
//!
//! A dequeued job always runs to a terminal outcome; there is no cancel.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::job::{PrintJob, PrintOutcome};
use crate::error::CounterprintError;
use crate::session::ConnectionSession;

/// Print activity, for display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueActivity {
    /// A job is on the wire
    pub printing: bool,
    /// Jobs waiting behind the current one
    pub pending: usize,
    pub succeeded: u64,
    pub failed: u64,
}

impl QueueActivity {
    /// Jobs not yet finished, including the one printing
    pub fn jobs(&self) -> usize {
        self.pending + usize::from(self.printing)
    }
}

struct Queued {
    job: PrintJob,
    reply: oneshot::Sender<PrintOutcome>,
}

/// A queued job's claim on its outcome
#[derive(Debug)]
pub struct PrintTicket {
    document_id: String,
    outcome: oneshot::Receiver<PrintOutcome>,
}

impl PrintTicket {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Wait for the job's terminal outcome.
    pub async fn outcome(self) -> PrintOutcome {
        self.outcome.await.unwrap_or_else(|_| {
            PrintOutcome::Failed(CounterprintError::Transport("Print worker stopped".into()))
        })
    }
}

/// FIFO print queue with a single background writer
#[derive(Debug)]
pub struct PrintJobSerializer {
    tx: mpsc::UnboundedSender<Queued>,
    activity: Arc<watch::Sender<QueueActivity>>,
    worker: JoinHandle<()>,
}

impl PrintJobSerializer {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(session: Arc<ConnectionSession>, write_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (activity, _) = watch::channel(QueueActivity::default());
        let activity = Arc::new(activity);

        let worker = tokio::spawn(run_worker(session, rx, activity.clone(), write_timeout));

        Self {
            tx,
            activity,
            worker,
        }
    }

    /// Queue a job now and get a ticket for its outcome.
    ///
    /// The queue position is fixed when this returns.
    pub fn enqueue(&self, job: PrintJob) -> PrintTicket {
        let (reply, outcome) = oneshot::channel();
        let document_id = job.document_id.clone();

        self.activity.send_modify(|activity| activity.pending += 1);
        if let Err(mpsc::error::SendError(queued)) = self.tx.send(Queued { job, reply }) {
            self.activity.send_modify(|activity| activity.pending -= 1);
            let _ = queued.reply.send(PrintOutcome::Failed(CounterprintError::Transport(
                "Print worker stopped".into(),
            )));
        }

        PrintTicket {
            document_id,
            outcome,
        }
    }

    /// Queue a job and wait for it to finish.
    pub async fn submit(&self, job: PrintJob) -> PrintOutcome {
        self.enqueue(job).outcome().await
    }

    pub fn activity(&self) -> QueueActivity {
        *self.activity.borrow()
    }

    pub fn watch_activity(&self) -> watch::Receiver<QueueActivity> {
        self.activity.subscribe()
    }
}

impl Drop for PrintJobSerializer {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    session: Arc<ConnectionSession>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
    activity: Arc<watch::Sender<QueueActivity>>,
    write_timeout: Duration,
) {
    while let Some(Queued { job, reply }) = rx.recv().await {
        activity.send_modify(|activity| {
            activity.pending = activity.pending.saturating_sub(1);
            activity.printing = true;
        });

        let outcome = execute(&session, &job, write_timeout).await;

        activity.send_modify(|activity| {
            activity.printing = false;
            if outcome.is_success() {
                activity.succeeded += 1;
            } else {
                activity.failed += 1;
            }
        });

        if reply.send(outcome).is_err() {
            debug!("Outcome for {} had no listener", job.document_id);
        }
    }
    debug!("Print worker stopped");
}

async fn execute(session: &ConnectionSession, job: &PrintJob, write_timeout: Duration) -> PrintOutcome {
    let Some(active) = session.active_link() else {
        debug!("No printer connected for {}", job.document_id);
        return PrintOutcome::Failed(CounterprintError::NoPrinterConnected);
    };

    info!(
        "Printing {} on {} ({} bytes, attempt {})",
        job.document_id,
        active.device,
        job.payload.len(),
        job.attempt
    );

    let write = async {
        let mut link = active.link.lock().await;
        match link.as_mut() {
            Some(link) => tokio::time::timeout(write_timeout, link.write_all(&job.payload))
                .await
                .unwrap_or_else(|_| {
                    Err(CounterprintError::Transport(format!(
                        "Write timed out after {:?}",
                        write_timeout
                    )))
                }),
            None => Err(CounterprintError::Transport("Link already closed".into())),
        }
    };

    let result = tokio::select! {
        biased;
        _ = session.link_lost(active.generation) => Err(CounterprintError::Transport(format!(
            "Link to {} lost during print",
            active.device
        ))),
        result = write => result,
    };

    match result {
        Ok(()) => {
            info!("Printed {}", job.document_id);
            PrintOutcome::Succeeded
        }
        Err(e) => {
            let e = e.into_transport();
            warn!("Print of {} failed: {}", job.document_id, e);
            session.transport_failed(active.generation, e.to_string()).await;
            PrintOutcome::Failed(e)
        }
    }
}
