//! ==============================================================================
//! main.rs - secador host entry point
//! ==============================================================================
//!
//! purpose:
//!     runs the sensor aggregator for the dryer rig and reports what it sees.
//!     this is the smallest possible snapshot consumer: the csv logger and the
//!     terminal dashboard read the same `snapshot()` and live elsewhere.
//!
//! responsibilities:
//!     - parse cli flags, load secador.toml, apply overrides
//!     - initialize tracing
//!     - start the aggregator (mqtt + scale)
//!     - log a snapshot line every report interval, and link changes
//!     - stop cleanly on ctrl-c
//!
//! ==============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use secador_host::config::LoggingConfig;
use secador_host::{HealthReport, HostConfig, SensorAggregator, SensorState};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Aggregate dryer rig telemetry from the mqtt bus and the serial scale.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Path to secador.toml (default: config/secador.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT broker host
    #[arg(long)]
    broker: Option<String>,

    /// MQTT topic carrying the environment json
    #[arg(long)]
    topic: Option<String>,

    /// Serial port of the scale
    #[arg(short = 'p', long)]
    serial_port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// How often to log a snapshot (ms)
    #[arg(long)]
    report_interval_ms: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut HostConfig) {
        if let Some(broker) = &self.broker {
            config.bus.host = broker.clone();
        }
        if let Some(topic) = &self.topic {
            config.bus.topic = topic.clone();
        }
        if let Some(port) = &self.serial_port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud = baud;
        }
        if let Some(ms) = self.report_interval_ms {
            config.monitor.report_interval_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // step 1: configuration (logging is not up yet, errors go out through anyhow)
    let config_path = cli.config.clone().or_else(HostConfig::find);
    let mut config = match &config_path {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    // step 2: logging
    init_logging(&config.logging);
    match &config_path {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => warn!("No config file found - using defaults"),
    }
    config.log_summary();

    // step 3: ingestion
    let mut aggregator = SensorAggregator::new(config.clone());
    aggregator.start()?;

    // step 4: report loop
    let mut ticker = tokio::time::interval(config.monitor.report_interval());
    let mut last_health = HealthReport::default();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if config.logging.show_sensor_data {
                    log_snapshot(&aggregator.snapshot());
                }
                let health = aggregator.health();
                if health.bus_state != last_health.bus_state
                    || health.serial_state != last_health.serial_state
                {
                    info!(bus = ?health.bus_state, scale = ?health.serial_state, "link status");
                }
                last_health = health;
            }
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    warn!("Failed to listen for ctrl-c: {e}");
                }
                break;
            }
        }
    }

    // step 5: shutdown
    info!("Shutting down...");
    aggregator.stop().await;
    let health = aggregator.health();
    info!(
        bus_messages = health.bus_messages,
        bus_decode_errors = health.bus_decode_errors,
        bus_connect_failures = health.bus_connect_failures,
        scale_frames = health.serial_frames,
        scale_parse_failures = health.serial_parse_failures,
        scale_open_failures = health.serial_open_failures,
        scale_io_errors = health.serial_io_errors,
        "final health"
    );

    Ok(())
}

/// RUST_LOG wins; otherwise the level from the config file
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_snapshot(s: &SensorState) {
    info!(
        ts = s.timestamp_ms,
        t1 = s.temperature1_c,
        rh1 = s.humidity1_rh,
        t2 = s.temperature2_c,
        rh2 = s.humidity2_rh,
        rad = s.radiation_w_m2,
        thermocouples = ?s.thermocouples_c,
        fans = ?s.fans,
        mass = %s.mass_text,
        "snapshot"
    );
}
