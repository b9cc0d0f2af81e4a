//! Print jobs and their terminal outcomes.

use chrono::{DateTime, Utc};

use crate::error::{CounterprintError, Result};

/// One document's bytes on their way to the printer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    pub document_id: String,
    /// Opaque printer payload
    pub payload: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
    /// 1 for the first try of a document, counting up on each retry
    pub attempt: u32,
}

impl PrintJob {
    pub fn new(document_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            document_id: document_id.into(),
            payload: payload.into(),
            submitted_at: Utc::now(),
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Terminal outcome of a job
#[derive(Debug)]
pub enum PrintOutcome {
    Succeeded,
    Failed(CounterprintError),
}

impl PrintOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PrintOutcome::Succeeded)
    }

    pub fn failure(&self) -> Option<&CounterprintError> {
        match self {
            PrintOutcome::Succeeded => None,
            PrintOutcome::Failed(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            PrintOutcome::Succeeded => Ok(()),
            PrintOutcome::Failed(e) => Err(e),
        }
    }
}
