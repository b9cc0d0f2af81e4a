//! # Printer Module
//!
//! Print jobs and the worker that puts them on the wire.
//!
//! ## Modules
//!
//! - [`job`]: Print job and outcome types
//! - [`serializer`]: FIFO queue with a single writer per link

pub mod job;
pub mod serializer;

pub use job::{PrintJob, PrintOutcome};
pub use serializer::{PrintJobSerializer, PrintTicket, QueueActivity};
