//! # Bluetooth RFCOMM Transport
//!
//! Printer links over the Bluetooth Serial Port Profile (SPP), through the
//! kernel's `/dev/rfcommN` TTY devices.
//!
//! ## Bluetooth Setup (Linux)
//!
//! The printer must be paired first. When no RFCOMM device is bound to its
//! address yet, [`RfcommConnector`] binds one:
//!
//! ```bash
//! $ bluetoothctl connect 00:11:62:XX:XX:XX
//! $ l2ping -c 1 00:11:62:XX:XX:XX
//! $ sudo rfcomm bind 0 00:11:62:XX:XX:XX 1
//! # This creates /dev/rfcomm0
//! ```
//!
//! ## TTY Configuration
//!
//! The RFCOMM device is opened in raw mode so binary data is transmitted
//! without modification:
//!
//! - **No input processing**: IGNBRK, BRKINT, PARMRK, ISTRIP, etc. cleared
//! - **No output processing**: OPOST cleared (no CR/LF translation)
//! - **8-bit characters**: CS8, no parity
//! - **No echo, non-canonical**: ECHO, ECHONL, ICANON cleared
//!
//! ## Chunked Writes
//!
//! Payloads larger than the chunk size are written in pieces with a short
//! pause between them so the Bluetooth buffer is not overrun. Writes run on
//! the blocking pool.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{LinkConnector, PrinterLink};
use crate::config::RfcommConfig;
use crate::error::{CounterprintError, Result};
use crate::lock;
use crate::registry::Device;

/// SPP channel printers listen on
const SPP_CHANNEL: &str = "1";

/// Time for a fresh baseband connection or binding to settle
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Held for as long as anything may write to one device node
type PathGuard = Arc<OwnedMutexGuard<()>>;

/// A blocking write that has not been joined yet
#[derive(Debug)]
struct PendingWrite {
    task: JoinHandle<(File, Result<()>)>,
    cancel: Arc<AtomicBool>,
}

/// Asks the blocking writer to stop if the write future is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// An open `/dev/rfcommN` device
///
/// The file moves to the blocking pool for each write. If the write future
/// is dropped, the writer stops at the next chunk boundary and the next
/// write or [`close`](PrinterLink::close) joins it before touching the file.
#[derive(Debug)]
pub struct RfcommLink {
    path: String,
    file: Option<File>,
    pending: Option<PendingWrite>,
    guard: Option<PathGuard>,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl RfcommLink {
    /// Open an RFCOMM device in raw mode.
    ///
    /// ## Errors
    ///
    /// Returns a transport error if the device doesn't exist, access is
    /// denied (may need root or the dialout group), or TTY setup fails.
    pub fn open(path: impl AsRef<Path>, config: &RfcommConfig) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new().write(true).open(path).map_err(|e| {
            CounterprintError::Transport(format!("Failed to open {}: {}", path.display(), e))
        })?;

        configure_tty_raw(&file)?;

        Ok(Self::from_file(path, file, config))
    }

    fn from_file(path: &Path, file: File, config: &RfcommConfig) -> Self {
        Self {
            path: path.display().to_string(),
            file: Some(file),
            pending: None,
            guard: None,
            chunk_size: config.chunk_size.max(1),
            chunk_delay: Duration::from_millis(config.chunk_delay_ms),
        }
    }

    fn holding(mut self, guard: OwnedMutexGuard<()>) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for an abandoned write and take the file back.
    async fn reclaim(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            debug!("Waiting for abandoned write on {}", self.path);
            pending.cancel.store(true, Ordering::Release);
            let (file, result) = pending
                .task
                .await
                .map_err(|e| CounterprintError::Transport(format!("Write task failed: {}", e)))?;
            if let Err(e) = result {
                debug!("Abandoned write on {} ended: {}", self.path, e);
            }
            self.file = Some(file);
        }
        Ok(())
    }
}

#[async_trait]
impl PrinterLink for RfcommLink {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.reclaim().await?;
        let mut file = self
            .file
            .take()
            .ok_or_else(|| CounterprintError::Transport(format!("{} is closed", self.path)))?;
        let data = data.to_vec();
        let chunk_size = self.chunk_size;
        let chunk_delay = self.chunk_delay;
        let cancel = Arc::new(AtomicBool::new(false));

        let task = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            let guard = self.guard.clone();
            move || {
                let _guard = guard;
                let result = write_chunked(&mut file, &data, chunk_size, chunk_delay, &cancel);
                (file, result)
            }
        });

        let _cancel_on_drop = CancelOnDrop(cancel.clone());
        let pending = self.pending.insert(PendingWrite { task, cancel });
        let joined = (&mut pending.task).await;
        self.pending = None;

        let (file, result) =
            joined.map_err(|e| CounterprintError::Transport(format!("Write task failed: {}", e)))?;
        self.file = Some(file);
        result
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.reclaim().await?;
        if let Some(mut file) = self.file.take() {
            debug!("Closing {}", self.path);
            tokio::task::spawn_blocking(move || file.flush())
                .await
                .map_err(|e| CounterprintError::Transport(format!("Close task failed: {}", e)))?
                .map_err(|e| CounterprintError::Transport(format!("Flush failed: {}", e)))?;
        }
        Ok(())
    }
}

fn write_chunked(
    file: &mut File,
    data: &[u8],
    chunk_size: usize,
    chunk_delay: Duration,
    cancel: &AtomicBool,
) -> Result<()> {
    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        if cancel.load(Ordering::Acquire) {
            return Err(CounterprintError::Transport(format!(
                "Write abandoned after {} of {} bytes",
                index * chunk_size,
                data.len()
            )));
        }
        if index > 0 && !chunk_delay.is_zero() {
            thread::sleep(chunk_delay);
        }
        file.write_all(chunk)
            .map_err(|e| CounterprintError::Transport(format!("Write failed: {}", e)))?;
    }

    file.flush()
        .map_err(|e| CounterprintError::Transport(format!("Flush failed: {}", e)))
}

/// Configure a file for raw TTY mode.
///
/// IXON/IXOFF/IXANY are cleared too: 0x11 (XON) and 0x13 (XOFF) can appear
/// in binary payloads.
#[cfg(unix)]
fn configure_tty_raw(file: &File) -> Result<()> {
    use std::mem::MaybeUninit;
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();

    let mut termios = MaybeUninit::uninit();
    let result = unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) };
    if result != 0 {
        return Err(CounterprintError::Transport(format!(
            "tcgetattr failed: {}",
            io::Error::last_os_error()
        )));
    }
    let mut termios = unsafe { termios.assume_init() };

    termios.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL
        | libc::IXON
        | libc::IXOFF
        | libc::IXANY);
    termios.c_oflag &= !libc::OPOST;
    termios.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
    termios.c_cflag &= !(libc::CSIZE | libc::PARENB);
    termios.c_cflag |= libc::CS8;

    let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) };
    if result != 0 {
        return Err(CounterprintError::Transport(format!(
            "tcsetattr failed: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
fn configure_tty_raw(_file: &File) -> Result<()> {
    Ok(())
}

/// Opens [`RfcommLink`]s, binding a device node first when needed
///
/// A node is not reopened until every earlier link on it, including a
/// write still draining on the blocking pool, has let go.
#[derive(Debug, Clone, Default)]
pub struct RfcommConnector {
    config: RfcommConfig,
    nodes: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RfcommConnector {
    pub fn new(config: RfcommConfig) -> Self {
        Self {
            config,
            nodes: Arc::default(),
        }
    }

    fn node(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.nodes).entry(path.to_string()).or_default().clone()
    }
}

#[async_trait]
impl LinkConnector for RfcommConnector {
    async fn open(&self, device: &Device) -> Result<Box<dyn PrinterLink>> {
        if !is_valid_mac(&device.id) {
            return Err(CounterprintError::Transport(format!(
                "Invalid Bluetooth address: {}",
                device.id
            )));
        }

        let path = match find_rfcomm_for_mac(&device.id).await? {
            Some(path) => {
                debug!("{} already bound to {}", device.id, path);
                path
            }
            None => bind_rfcomm(&device.id, self.config.channel).await?,
        };

        let node = self.node(&path);
        let guard = match node.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Waiting for the previous link on {} to finish", path);
                node.lock_owned().await
            }
        };

        let config = self.config.clone();
        let link = tokio::task::spawn_blocking(move || RfcommLink::open(path, &config))
            .await
            .map_err(|e| CounterprintError::Transport(format!("Open task failed: {}", e)))??
            .holding(guard);

        info!("Opened {} for {}", link.path(), device);
        Ok(Box::new(link))
    }
}

// ============================================================================
// RFCOMM SETUP HELPERS
// ============================================================================

/// Validate a Bluetooth MAC address format (XX:XX:XX:XX:XX:XX).
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return false;
    }
    parts
        .iter()
        .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Pick the device name out of an RFCOMM binding line that mentions `mac`.
///
/// Lines look like `rfcomm0: 00:11:62:AA:BB:CC channel 1 clean`.
fn parse_rfcomm_binding(listing: &str, mac: &str) -> Option<String> {
    let mac_upper = mac.to_uppercase();
    listing
        .lines()
        .filter(|line| line.to_uppercase().contains(&mac_upper))
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .find(|name| name.starts_with("rfcomm"))
        .map(|name| format!("/dev/{}", name))
}

/// Find an existing RFCOMM device bound to the given MAC address.
///
/// Checks `/proc/net/rfcomm` and falls back to `rfcomm -a`.
pub async fn find_rfcomm_for_mac(mac: &str) -> Result<Option<String>> {
    if let Ok(contents) = tokio::fs::read_to_string("/proc/net/rfcomm").await
        && let Some(path) = parse_rfcomm_binding(&contents, mac)
        && Path::new(&path).exists()
    {
        return Ok(Some(path));
    }

    let output = Command::new("rfcomm")
        .arg("-a")
        .output()
        .await
        .map_err(|e| CounterprintError::Transport(format!("Failed to run 'rfcomm -a': {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_rfcomm_binding(&stdout, mac).filter(|path| Path::new(path).exists()))
}

/// Bind `/dev/rfcomm<channel>` to a MAC address.
///
/// Runs `bluetoothctl connect`, verifies reachability with `l2ping`, then
/// `rfcomm bind`. **Requires root privileges** for the bind step.
pub async fn bind_rfcomm(mac: &str, channel: u8) -> Result<String> {
    let mac_upper = mac.to_uppercase();
    let device_path = format!("/dev/rfcomm{}", channel);

    info!("Connecting to {}", mac_upper);
    let output = Command::new("bluetoothctl")
        .arg("connect")
        .arg(&mac_upper)
        .output()
        .await
        .map_err(|e| CounterprintError::Transport(format!("Failed to run bluetoothctl: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !(stdout.contains("Connection successful") || stdout.contains("already connected")) {
        // l2ping below decides whether the device is usable
        warn!("bluetoothctl returned: {}", stdout.trim());
    }

    tokio::time::sleep(SETTLE_DELAY).await;

    let output = Command::new("l2ping")
        .arg("-c")
        .arg("1")
        .arg(&mac_upper)
        .output()
        .await
        .map_err(|e| CounterprintError::Transport(format!("Failed to run l2ping: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CounterprintError::Transport(format!(
            "Device {} not reachable: {}",
            mac_upper,
            stderr.trim()
        )));
    }

    info!("Binding rfcomm{} to {}", channel, mac_upper);
    let output = Command::new("rfcomm")
        .arg("bind")
        .arg(channel.to_string())
        .arg(&mac_upper)
        .arg(SPP_CHANNEL)
        .output()
        .await
        .map_err(|e| CounterprintError::Transport(format!("Failed to run rfcomm bind: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CounterprintError::Transport(format!(
            "rfcomm bind failed: {}",
            stderr.trim()
        )));
    }

    tokio::time::sleep(SETTLE_DELAY).await;

    if !Path::new(&device_path).exists() {
        return Err(CounterprintError::Transport(format!(
            "Device {} was not created",
            device_path
        )));
    }

    Ok(device_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_valid_mac_addresses() {
        assert!(is_valid_mac("00:11:22:33:44:55"));
        assert!(is_valid_mac("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn test_invalid_mac_addresses() {
        assert!(!is_valid_mac("00:11:22:33:44")); // too short
        assert!(!is_valid_mac("00:11:22:33:44:55:66")); // too long
        assert!(!is_valid_mac("00-11-22-33-44-55")); // wrong separator
        assert!(!is_valid_mac("GG:HH:II:JJ:KK:LL")); // invalid hex
        assert!(!is_valid_mac(""));
    }

    #[test]
    fn test_parse_proc_binding() {
        let listing = "rfcomm0: 00:11:62:AA:BB:CC channel 1 clean\n\
                       rfcomm1: 00:11:62:DD:EE:FF channel 1 connected\n";
        assert_eq!(
            parse_rfcomm_binding(listing, "00:11:62:dd:ee:ff"),
            Some("/dev/rfcomm1".to_string())
        );
        assert_eq!(parse_rfcomm_binding(listing, "00:11:62:00:00:00"), None);
    }

    #[test]
    fn test_parse_ignores_non_rfcomm_lines() {
        let listing = "Can't open RFCOMM control socket: 00:11:62:AA:BB:CC\n";
        assert_eq!(parse_rfcomm_binding(listing, "00:11:62:AA:BB:CC"), None);
    }

    #[test]
    fn test_chunked_write_delivers_everything() {
        let mut tmp = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        write_chunked(tmp.as_file_mut(), &data, 4096, Duration::ZERO, &AtomicBool::new(false)).unwrap();

        assert_eq!(std::fs::read(tmp.path()).unwrap(), data);
    }

    #[test]
    fn test_cancelled_write_stops_before_next_chunk() {
        let mut tmp = NamedTempFile::new().unwrap();
        let err = write_chunked(tmp.as_file_mut(), b"abcdef", 2, Duration::ZERO, &AtomicBool::new(true))
            .unwrap_err();

        assert!(matches!(err, CounterprintError::Transport(msg) if msg.contains("abandoned")));
        assert!(std::fs::read(tmp.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_write_is_joined_before_close() {
        let tmp = NamedTempFile::new().unwrap();
        let config = RfcommConfig {
            chunk_size: 1,
            chunk_delay_ms: 20,
            ..RfcommConfig::default()
        };
        let file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
        let mut link = Box::new(RfcommLink::from_file(tmp.path(), file, &config));

        let payload = [b'x'; 50];
        let timed_out = tokio::time::timeout(Duration::from_millis(50), link.write_all(&payload)).await;
        assert!(timed_out.is_err());

        link.close().await.unwrap();

        // The writer has stopped for good once close returns
        let written = std::fs::read(tmp.path()).unwrap().len();
        assert!(written < payload.len());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(std::fs::read(tmp.path()).unwrap().len(), written);
    }

    #[tokio::test]
    async fn test_write_after_abandoned_write_reuses_file() {
        let tmp = NamedTempFile::new().unwrap();
        let config = RfcommConfig {
            chunk_size: 1,
            chunk_delay_ms: 20,
            ..RfcommConfig::default()
        };
        let file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
        let mut link = RfcommLink::from_file(tmp.path(), file, &config);

        let _ = tokio::time::timeout(Duration::from_millis(30), link.write_all(&[b'a'; 50])).await;
        link.write_all(b"bb").await.unwrap();

        let contents = std::fs::read(tmp.path()).unwrap();
        assert!(contents.ends_with(b"bb"));
        assert!(contents[..contents.len() - 2].iter().all(|b| *b == b'a'));
    }

    #[test]
    fn test_connector_shares_one_gate_per_node() {
        let connector = RfcommConnector::default();
        let other = connector.clone();
        assert!(Arc::ptr_eq(&connector.node("/dev/rfcomm0"), &other.node("/dev/rfcomm0")));
        assert!(!Arc::ptr_eq(&connector.node("/dev/rfcomm0"), &connector.node("/dev/rfcomm1")));
    }

    #[tokio::test]
    async fn test_connector_rejects_invalid_address() {
        let connector = RfcommConnector::default();
        let err = connector
            .open(&Device::bonded("not-a-mac", "Printer"))
            .await
            .unwrap_err();
        assert!(matches!(err, CounterprintError::Transport(msg) if msg.contains("Invalid")));
    }

    // Opening real links requires hardware and is exercised manually.
}
