//! # Error Types
//!
//! This module defines the error type shared by every counterprint component.
//!
//! Hardware faults (`ConnectTimeout`, `Transport`) are reported to the
//! immediate caller as failed outcomes. Precondition violations
//! (`AlreadyConnected`, `ScanInProgress`, `NoPrinterConnected`, `Busy`) are
//! caller errors: the component rejects the request and leaves its state
//! untouched.

use thiserror::Error;

/// Main error type for counterprint operations
#[derive(Debug, Error)]
pub enum CounterprintError {
    /// The radio could not be toggled (denied by the OS or timed out),
    /// or an operation needed the radio powered on.
    #[error("Radio error: {0}")]
    Radio(String),

    /// A radio toggle or session transition is already in flight
    #[error("Another operation is already in progress")]
    Busy,

    /// Only one discovery session may run at a time
    #[error("A device scan is already in progress")]
    ScanInProgress,

    /// A different device holds the printer link
    #[error("Already connected to {0}; disconnect first")]
    AlreadyConnected(String),

    /// The transport did not acknowledge the connection in time
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    /// `reconnect` was called before any device was ever connected
    #[error("No previously connected device to reconnect to")]
    NoPriorDevice,

    /// A print job reached the head of the queue with no live link
    #[error("No printer connected")]
    NoPrinterConnected,

    /// Transport-level errors (link lost, write failed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A required platform permission is not granted
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CounterprintError {
    /// True for errors caused by calling an operation in the wrong state.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Busy
                | Self::ScanInProgress
                | Self::AlreadyConnected(_)
                | Self::NoPriorDevice
                | Self::NoPrinterConnected
        )
    }

    /// Collapse any error into a transport failure, keeping its message.
    pub(crate) fn into_transport(self) -> Self {
        match self {
            Self::Transport(_) => self,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CounterprintError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors() {
        assert!(CounterprintError::ScanInProgress.is_caller_error());
        assert!(CounterprintError::AlreadyConnected("A".into()).is_caller_error());
        assert!(!CounterprintError::ConnectTimeout("A".into()).is_caller_error());
        assert!(!CounterprintError::Transport("gone".into()).is_caller_error());
    }

    #[test]
    fn test_into_transport_keeps_message() {
        let err = CounterprintError::Io(std::io::Error::other("pipe closed")).into_transport();
        match err {
            CounterprintError::Transport(msg) => assert!(msg.contains("pipe closed")),
            other => panic!("expected transport error, got {other:?}"),
        }

        let err = CounterprintError::Transport("link lost".into()).into_transport();
        assert_eq!(err.to_string(), "Transport error: link lost");
    }
}
