//! # Station Configuration
//!
//! Timeouts, intervals and transport tuning for a print station, loaded from
//! an optional TOML file. Every field has a default, so an empty file (or no
//! file at all) gives a working configuration.
//!
//! ```toml
//! connect_timeout_secs = 20
//! reconnect_idle_session = true
//!
//! [rfcomm]
//! channel = 1
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CounterprintError, Result};

/// Print station configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Bound for a radio enable/disable request
    pub radio_toggle_timeout_secs: u64,

    /// Default discovery window when the caller gives none
    pub scan_timeout_secs: u64,

    /// Bound for the transport to acknowledge a connection
    pub connect_timeout_secs: u64,

    /// Bound for writing one job's payload to the printer
    pub write_timeout_secs: u64,

    /// Print queue polling interval
    pub poll_interval_secs: u64,

    /// Let the print queue call `reconnect()` once per tick while disconnected
    pub reconnect_idle_session: bool,

    /// Escalate a failing document to a warning every N attempts
    pub warn_after_attempts: u32,

    /// BlueZ adapter to use (`hci0`, ...); the default adapter when unset
    pub adapter: Option<String>,

    /// RFCOMM transport tuning
    pub rfcomm: RfcommConfig,
}

/// RFCOMM transport tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfcommConfig {
    /// `/dev/rfcommN` slot used when a new binding is needed
    pub channel: u8,

    /// Bytes per write chunk
    pub chunk_size: usize,

    /// Pause between chunks in milliseconds
    pub chunk_delay_ms: u64,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            radio_toggle_timeout_secs: 10,
            scan_timeout_secs: 30,
            connect_timeout_secs: 15,
            write_timeout_secs: 60,
            poll_interval_secs: 5,
            reconnect_idle_session: false,
            warn_after_attempts: 10,
            adapter: None,
            rfcomm: RfcommConfig::default(),
        }
    }
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            chunk_size: 4096,
            chunk_delay_ms: 2,
        }
    }
}

impl StationConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            CounterprintError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| CounterprintError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero timeouts and intervals.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("radio_toggle_timeout_secs", self.radio_toggle_timeout_secs),
            ("scan_timeout_secs", self.scan_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("rfcomm.chunk_size", self.rfcomm.chunk_size as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(CounterprintError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn radio_toggle_timeout(&self) -> Duration {
        Duration::from_secs(self.radio_toggle_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
