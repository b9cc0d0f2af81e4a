//! # Counterprint CLI
//!
//! Command-line interface for a Bluetooth receipt printing station.
//!
//! ## Usage
//!
//! ```bash
//! # Show or toggle the Bluetooth radio
//! counterprint radio
//! counterprint radio on
//!
//! # List bonded devices, or discover nearby ones
//! counterprint devices
//! counterprint scan --timeout 10
//!
//! # Print a file once
//! counterprint print --device 00:11:62:AA:BB:CC receipt.txt
//!
//! # Print everything dropped into a spool directory
//! counterprint run --device 00:11:62:AA:BB:CC --spool /var/spool/counterprint
//!
//! # Serve the HTTP control API
//! counterprint serve --listen 0.0.0.0:8080
//!
//! # Any of the above against a simulated printer
//! counterprint --simulate serve
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use counterprint::{
    CounterprintError, Device, PrintJob, PrintStation, StationConfig, bluez,
    server::{self, ServerConfig},
    sim::SimulatedBluetooth,
    spool::SpoolDirectory,
};

/// Counterprint - Bluetooth receipt printing station
#[derive(Parser, Debug)]
#[command(name = "counterprint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use a simulated Bluetooth stack instead of BlueZ
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the radio state, or turn it on or off
    Radio {
        action: Option<RadioAction>,
    },

    /// List bonded devices
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Discover nearby devices
    Scan {
        /// Discovery window in seconds (defaults to the configured value)
        #[arg(long)]
        timeout: Option<u64>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print a file once and exit
    Print {
        /// Printer Bluetooth address
        #[arg(long)]
        device: String,

        /// File whose bytes are sent to the printer
        file: PathBuf,
    },

    /// Print documents from a spool directory until interrupted
    Run {
        /// Printer Bluetooth address to connect to first
        #[arg(long)]
        device: Option<String>,

        /// Spool directory
        #[arg(long, value_name = "DIR")]
        spool: PathBuf,

        /// Reconnect to the last printer when the link drops
        #[arg(long)]
        reconnect: bool,
    },

    /// Serve the HTTP control API
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: String,

        /// Printer Bluetooth address to connect to first
        #[arg(long)]
        device: Option<String>,

        /// Also print documents from this spool directory
        #[arg(long, value_name = "DIR")]
        spool: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RadioAction {
    On,
    Off,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("counterprint=info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CounterprintError> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => StationConfig::load(path)?,
        None => StationConfig::default(),
    };
    if let Commands::Run { reconnect: true, .. } = &cli.command {
        config.reconnect_idle_session = true;
    }

    let backend = if cli.simulate {
        info!("Using simulated Bluetooth stack");
        demo_bluetooth().backend()
    } else {
        bluez::backend(&config).await?
    };
    let station = Arc::new(PrintStation::start(config, backend).await?);

    match cli.command {
        Commands::Radio { action } => {
            match action {
                Some(RadioAction::On) => station.radio().enable().await?,
                Some(RadioAction::Off) => station.radio().disable().await?,
                None => {}
            }
            println!("Bluetooth radio: {}", station.radio().state());
        }

        Commands::Devices { json } => {
            let bonded = station.registry().refresh_bonded().await?;
            print_devices(&bonded, json)?;
        }

        Commands::Scan { timeout, json } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| station.config().scan_timeout());
            if !json {
                println!("Scanning for {} seconds...", timeout.as_secs());
            }
            let found = station.registry().start_scan(timeout).await?;
            print_devices(&found, json)?;
        }

        Commands::Print { device, file } => {
            let payload = tokio::fs::read(&file).await?;
            station.connect_by_id(&device).await?;

            println!("Printing {}...", file.display());
            let outcome = station
                .printer()
                .submit(PrintJob::new(document_id_for(&file), payload))
                .await;
            station.shutdown().await?;
            outcome.into_result()?;
            println!("Printed successfully!");
        }

        Commands::Run { device, spool, .. } => {
            if let Some(device) = device {
                connect_or_warn(&station, &device).await;
            }

            let source = Arc::new(SpoolDirectory::open(&spool).await?);
            let queue = station.print_queue(source).start();
            println!("Watching {} (Ctrl-C to stop)", spool.display());

            tokio::signal::ctrl_c().await?;
            queue.stop().await;
            station.shutdown().await?;
        }

        Commands::Serve {
            listen,
            device,
            spool,
        } => {
            if let Some(device) = device {
                connect_or_warn(&station, &device).await;
            }

            let queue = match spool {
                Some(spool) => {
                    let source = Arc::new(SpoolDirectory::open(&spool).await?);
                    info!("Printing documents from {}", spool.display());
                    Some(station.print_queue(source).start())
                }
                None => None,
            };

            println!("Counterprint HTTP server listening on {}", listen);
            server::serve(station.clone(), ServerConfig { listen_addr: listen }).await?;

            if let Some(queue) = queue {
                queue.stop().await;
            }
            station.shutdown().await?;
        }
    }

    Ok(())
}

/// Stand-in host for `--simulate`
fn demo_bluetooth() -> SimulatedBluetooth {
    SimulatedBluetooth::new()
        .with_bonded("00:11:62:00:00:01", "Star TSP650II")
        .with_nearby("00:11:62:00:00:02", "Receipt Printer 2")
}

async fn connect_or_warn(station: &PrintStation, device: &str) {
    match station.connect_by_id(device).await {
        Ok(session) => {
            if let Some(device) = session.device {
                println!("Connected to {}", device);
            }
        }
        Err(e) => warn!("Could not connect to {}: {}", device, e),
    }
}

fn document_id_for(file: &Path) -> String {
    file.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn print_devices(devices: &[Device], json: bool) -> Result<(), CounterprintError> {
    if json {
        let text = serde_json::to_string_pretty(devices)
            .map_err(|e| CounterprintError::Io(std::io::Error::other(e)))?;
        println!("{}", text);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }
    for device in devices {
        println!("  {}  {}", device.id, device.display_name);
    }
    Ok(())
}
