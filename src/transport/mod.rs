//! # Printer Transport Layer
//!
//! A [`LinkConnector`] opens a [`PrinterLink`] to a device; the link carries
//! raw payload bytes to the printer until it is closed.
//!
//! ## Available Transports
//!
//! - [`rfcomm`]: Bluetooth RFCOMM serial links (Linux)
//! - [`crate::sim`]: in-memory links for tests and `--simulate`

pub mod rfcomm;

pub use rfcomm::{RfcommConnector, RfcommLink};

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::Result;
use crate::registry::Device;

/// An open byte channel to one printer
#[async_trait]
pub trait PrinterLink: Send + Debug {
    /// Write the whole payload, resolving once the transport has accepted it.
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Release the link.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens printer links
#[async_trait]
pub trait LinkConnector: Send + Sync + Debug {
    async fn open(&self, device: &Device) -> Result<Box<dyn PrinterLink>>;
}
