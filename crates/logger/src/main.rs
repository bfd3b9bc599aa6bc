//! gm1356-logger
//!
//! Polls a GM1356 sound level meter over USB HID and logs every sample to a
//! CSV file and a diagnostic log.

use anyhow::{Context, Result};
use clap::Parser;
use common::{StopSignal, setup_logging};
use logger::usb::{HidTransport, RusbTransport};
use logger::{CaptureLoop, CaptureOptions, LoggerConfig, SampleSink, finish_run};
use protocol::DeviceIdentity;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gm1356-logger")]
#[command(
    author,
    version,
    about = "GM1356 Logger - Record sound level meter samples over USB"
)]
#[command(long_about = "
Polls a GM1356 sound level meter every interval and records each sample to
two files in the log directory:

    data.csv      timestamp,level,unit            (rotated hourly)
    raw_log.txt   full decode, raw bytes, events  (rotated at 1 MiB, 5 backups)

Capture stops on Ctrl+C, when the meter is unplugged, or when --duration or
--max-samples is reached.

EXAMPLES:
    # Run with default config
    gm1356-logger

    # Sample every second for ten minutes
    gm1356-logger --interval-ms 1000 --duration 600

    # Show attached meters without capturing
    gm1356-logger --list-devices

    # Run with debug logging
    gm1356-logger --log-level debug

CONFIGURATION:
    The logger looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/gm1356-logger/logger.toml
    3. /etc/gm1356-logger/logger.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached meters and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Directory for data.csv and raw_log.txt
    #[arg(long, value_name = "DIR")]
    log_dir: Option<String>,

    /// Milliseconds between polls (minimum 500)
    #[arg(short, long, value_name = "MS")]
    interval_ms: Option<u64>,

    /// Stop after this many seconds
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Stop after this many polls
    #[arg(long, value_name = "N")]
    max_samples: Option<u64>,
}

impl Args {
    /// Command line values win over the configuration file
    fn apply(&self, config: &mut LoggerConfig) {
        if let Some(level) = &self.log_level {
            config.capture.log_level = level.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.storage.log_dir = dir.clone();
        }
        if let Some(interval) = self.interval_ms {
            config.capture.poll_interval_ms = interval;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = LoggerConfig::default();
        let path = LoggerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        LoggerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        LoggerConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.capture.log_level).context("Failed to setup logging")?;

    info!("gm1356-logger v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.capture.log_level);

    let identity = config.device.identity()?;
    let transport =
        RusbTransport::new(config.device.write_timeout()).context("Failed to initialise USB")?;

    if args.list_devices {
        return list_devices_mode(&transport, identity);
    }

    let mut options = CaptureOptions::from_config(&config)?;
    options.max_samples = args.max_samples;

    run_capture(&config, transport, options, args.duration).await
}

/// List matching meters and exit
fn list_devices_mode(transport: &RusbTransport, identity: DeviceIdentity) -> Result<()> {
    info!("Listing devices matching {}...", identity);

    let devices = transport
        .enumerate(identity)
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No sound level meter ({}) found.", identity);
    } else {
        println!("Found {} device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }

    Ok(())
}

async fn run_capture(
    config: &LoggerConfig,
    transport: RusbTransport,
    options: CaptureOptions,
    duration: Option<u64>,
) -> Result<()> {
    let sink = Arc::new(SampleSink::new(&config.storage).context("Failed to open log files")?);
    info!(
        "Logging to {} and {}",
        config.storage.csv_path().display(),
        config.storage.raw_path().display()
    );

    let stop = StopSignal::new();

    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping capture...");
                ctrl_c.trigger();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    if let Some(secs) = duration {
        let timer = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!("Capture duration of {}s elapsed", secs);
            timer.trigger();
        });
    }

    // Sync USB I/O stays off the async runtime
    let capture = CaptureLoop::new(transport, Arc::clone(&sink), stop, options);
    let result = tokio::task::spawn_blocking(move || capture.run())
        .await
        .context("Capture task panicked")?;

    finish_run(&sink, result).map(|_| ())
}
