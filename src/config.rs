//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `secador.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - BusConfig: MQTT broker, topic, keepalive and reconnect backoff.
//!     - SerialConfig: Scale port, baud rate, read timeout, retry backoffs.
//!     - LoggingConfig: Log level and whether to echo sensor data.
//!     - MonitorConfig: How often the binary reports a snapshot.
//!
//! ```text
//!     every section and field has a default, so a file only needs to name
//!     what differs from the rig's standard setup.
//! ```
//!
//! ==============================================================================

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    pub bus: BusConfig,
    pub serial: SerialConfig,
    pub logging: LoggingConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub keepalive_seconds: u64,
    pub topic: String,
    pub client_id: String,
    /// wait between failed connection attempts
    pub retry_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    pub read_timeout_ms: u64,
    /// wait after the port failed to open
    pub open_retry_ms: u64,
    /// wait after an open port failed mid-stream
    pub io_retry_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub report_interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keepalive_seconds: 60,
            topic: "secador/datos".to_string(),
            client_id: "secador-host".to_string(),
            retry_seconds: 2,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            read_timeout_ms: 1000,
            open_retry_ms: 2000,
            io_retry_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { report_interval_ms: 1000 }
    }
}

impl BusConfig {
    pub fn retry(&self) -> Duration {
        Duration::from_secs(self.retry_seconds)
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }

    pub fn io_retry(&self) -> Duration {
        Duration::from_millis(self.io_retry_ms)
    }
}

impl MonitorConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// First config file found in the usual places
    pub fn find() -> Option<PathBuf> {
        [
            PathBuf::from("config").join("secador.toml"),
            PathBuf::from("..").join("config").join("secador.toml"),
        ]
        .into_iter()
        .find(|path| path.exists())
    }

    /// Reject settings the transports cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.bus.host.trim().is_empty() {
            bail!("bus.host must not be empty");
        }
        if self.bus.topic.trim().is_empty() {
            bail!("bus.topic must not be empty");
        }
        // rumqttc refuses keepalives under 5s
        if self.bus.keepalive_seconds < 5 {
            bail!("bus.keepalive_seconds must be at least 5");
        }
        if self.serial.port.trim().is_empty() {
            bail!("serial.port must not be empty");
        }
        if self.serial.baud == 0 {
            bail!("serial.baud must be non-zero");
        }
        if self.bus.retry_seconds == 0 {
            bail!("bus.retry_seconds must be non-zero");
        }
        if self.serial.read_timeout_ms == 0 {
            bail!("serial.read_timeout_ms must be non-zero");
        }
        // a zero backoff turns the reconnect loops into busy spins
        if self.serial.open_retry_ms == 0 || self.serial.io_retry_ms == 0 {
            bail!("serial.open_retry_ms and serial.io_retry_ms must be non-zero");
        }
        if self.monitor.report_interval_ms == 0 {
            bail!("monitor.report_interval_ms must be non-zero");
        }
        Ok(())
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        info!(
            broker = %format!("{}:{}", self.bus.host, self.bus.port),
            topic = %self.bus.topic,
            keepalive_s = self.bus.keepalive_seconds,
            "bus config"
        );
        info!(
            port = %self.serial.port,
            baud = self.serial.baud,
            read_timeout_ms = self.serial.read_timeout_ms,
            "serial config"
        );
    }
}
