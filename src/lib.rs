//! # Counterprint - Bluetooth Receipt Printing Core
//!
//! Counterprint keeps one Bluetooth receipt printer connected and feeds it
//! documents from a pending-work source. It provides:
//!
//! - **Radio monitoring**: track the host Bluetooth radio and toggle it
//! - **Device registry**: bonded devices plus a single timed discovery scan
//! - **Connection session**: at most one live printer link, with reconnect
//! - **Job serializer**: FIFO printing, one job on the wire at a time
//! - **Print queue**: poll a document source and mark documents printed
//!
//! ## Quick Start
//!
//! ```no_run
//! use counterprint::{
//!     config::StationConfig,
//!     printer::PrintJob,
//!     sim::SimulatedBluetooth,
//!     station::PrintStation,
//! };
//!
//! # async fn example() -> counterprint::error::Result<()> {
//! let sim = SimulatedBluetooth::new().with_bonded("00:11:62:00:00:01", "Star TSP650II");
//! let station = PrintStation::start(StationConfig::default(), sim.backend()).await?;
//!
//! station.connect_by_id("00:11:62:00:00:01").await?;
//! station
//!     .printer()
//!     .submit(PrintJob::new("order-1042", b"Hello\n".to_vec()))
//!     .await
//!     .into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`radio`] | Radio power state and toggling |
//! | [`registry`] | Bonded and discovered devices |
//! | [`session`] | The single printer connection |
//! | [`printer`] | Print jobs and the FIFO serializer |
//! | [`queue`] | Polling orchestrator over a document source |
//! | [`permissions`] | Platform permission checks |
//! | [`transport`] | Printer link traits and RFCOMM backend |
//! | [`bluez`] | Linux radio and discovery over the BlueZ D-Bus API |
//! | [`sim`] | In-memory Bluetooth stack |
//! | [`spool`] | Directory-backed document source |
//! | [`station`] | Wires the components together |
//! | [`server`] | HTTP control surface |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error types |

pub mod bluez;
pub mod config;
pub mod error;
pub mod permissions;
pub mod printer;
pub mod queue;
pub mod radio;
pub mod registry;
pub mod server;
pub mod session;
pub mod sim;
pub mod spool;
pub mod station;
pub mod transport;

// Re-exports for convenience
pub use config::StationConfig;
pub use error::{CounterprintError, Result};
pub use printer::{PrintJob, PrintOutcome};
pub use radio::RadioState;
pub use registry::{BondState, Device};
pub use session::SessionState;
pub use station::PrintStation;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
