//! ==============================================================================
//! serial.rs - weighing scale ingestion over a serial link
//! ==============================================================================
//!
//! purpose:
//!     keeps the mass fields of the store current from a scale that prints one
//!     reading per line ("12.34 g", "7,5g", "ERR"), and survives the scale being
//!     unplugged, powered off, or never plugged in at all.
//!
//! loop structure:
//!
//! ```text
//!     ┌──────────── outer: open port ────────────┐
//!     │  fail -> wait open_retry -> try again    │
//!     │  ok   -> inner: read frame (bounded)     │
//!     │            io error -> wait io_retry ────┘
//!     │            stop flag -> exit
//!     └──────────────────────────────────────────
//! ```
//!
//! dual representation:
//!     the text of the reading is stored exactly (comma kept, unit stripped)
//!     because the csv logger persists it verbatim. the number is only for
//!     display; a frame that does not parse leaves the previous number alone.
//!
//! relationships:
//!     - used by: aggregator.rs (spawns SerialIngest::run)
//!     - writes: store.rs, health.rs
//!
//! ==============================================================================

use crate::aggregator::RunFlag;
use crate::config::SerialConfig;
use crate::domain::SensorUpdate;
use crate::error::{ParseMassError, SerialError};
use crate::health::{Health, LinkState};
use crate::store::StateStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

// ==============================================================================
// transport seam
// ==============================================================================
// the loop only sees these two traits. the real implementation is tokio-serial;
// tests plug in scripted fakes.

/// an open link to the scale
#[async_trait]
pub trait ScaleLink: Send {
    /// read one newline-terminated frame.
    ///
    /// `Ok(None)` means the timeout elapsed without a complete frame; any
    /// partial bytes are kept for the next call.
    async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, SerialError>;
}

/// something that can (try to) open the scale
#[async_trait]
pub trait ScaleConnector: Send + Sync {
    /// human readable target, for logs
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Box<dyn ScaleLink>, SerialError>;
}

pub struct TokioSerialConnector {
    port: String,
    baud: u32,
}

impl TokioSerialConnector {
    pub fn new(config: &SerialConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud: config.baud,
        }
    }
}

#[async_trait]
impl ScaleConnector for TokioSerialConnector {
    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud)
    }

    async fn open(&self) -> Result<Box<dyn ScaleLink>, SerialError> {
        let stream = tokio_serial::new(self.port.as_str(), self.baud)
            .open_native_async()
            .map_err(|e| SerialError::Open {
                port: self.port.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(SerialLink {
            reader: BufReader::new(stream),
            pending: Vec::new(),
        }))
    }
}

struct SerialLink {
    reader: BufReader<SerialStream>,
    pending: Vec<u8>,
}

#[async_trait]
impl ScaleLink for SerialLink {
    async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, SerialError> {
        // read_until appends into `pending`, so a frame cut by the timeout is
        // completed on the next call
        let read = tokio::time::timeout(timeout, self.reader.read_until(b'\n', &mut self.pending)).await;
        match read {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(SerialError::Disconnected),
            Ok(Ok(_)) => Ok(Some(std::mem::take(&mut self.pending))),
            Ok(Err(e)) => Err(SerialError::Io(e)),
        }
    }
}

// ==============================================================================
// frame parsing
// ==============================================================================

/// one reading from the scale
#[derive(Clone, Debug, PartialEq)]
pub struct MassReading {
    /// canonical text, stored verbatim
    pub text: String,
    pub grams: Result<f64, ParseMassError>,
}

/// turn a raw line into a reading; `None` for frames that are blank after trimming
pub fn parse_frame(raw: &[u8]) -> Option<MassReading> {
    // invalid utf-8 bytes are dropped, not replaced
    let decoded = String::from_utf8_lossy(raw).replace(char::REPLACEMENT_CHARACTER, "");
    let frame = decoded.trim();
    if frame.is_empty() {
        return None;
    }

    // a bare unit ("g") still counts: its text is "" and the number is kept
    let lower = frame.to_lowercase();
    let text = lower.strip_suffix('g').unwrap_or(&lower).trim();

    Some(MassReading {
        text: text.to_string(),
        grams: parse_grams(text),
    })
}

/// parse the numeric part of a reading, accepting a comma decimal separator
pub fn parse_grams(text: &str) -> Result<f64, ParseMassError> {
    let normalized = text.trim().replace(',', ".");
    if normalized.is_empty() {
        return Err(ParseMassError::Empty);
    }

    let value: f64 = normalized
        .parse()
        .map_err(|_| ParseMassError::NotNumeric(text.to_string()))?;

    if !value.is_finite() {
        return Err(ParseMassError::NotFinite(text.to_string()));
    }
    Ok(value)
}

// ==============================================================================
// ingestion loop
// ==============================================================================

pub struct SerialIngest {
    connector: Arc<dyn ScaleConnector>,
    store: Arc<StateStore>,
    health: Arc<Health>,
    flag: Arc<RunFlag>,
    read_timeout: Duration,
    open_retry: Duration,
    io_retry: Duration,
}

impl SerialIngest {
    pub fn new(
        config: &SerialConfig,
        connector: Arc<dyn ScaleConnector>,
        store: Arc<StateStore>,
        health: Arc<Health>,
        flag: Arc<RunFlag>,
    ) -> Self {
        Self {
            connector,
            store,
            health,
            flag,
            read_timeout: config.read_timeout(),
            open_retry: config.open_retry(),
            io_retry: config.io_retry(),
        }
    }

    /// run until the flag is cleared
    pub async fn run(self) {
        let target = self.connector.describe();
        info!(%target, "serial ingestion started");

        let mut failed_opens: u64 = 0;

        while self.flag.is_running() {
            self.health.set_serial_state(LinkState::Connecting);

            let mut link = match self.connector.open().await {
                Ok(link) => link,
                Err(e) => {
                    Health::bump(&self.health.serial_open_failures);
                    self.health.set_serial_state(LinkState::Disconnected);
                    failed_opens += 1;
                    // the scale is often just off; say so once, then stay quiet
                    if failed_opens == 1 {
                        warn!(%target, "scale not available, retrying: {e}");
                    } else {
                        debug!(%target, attempt = failed_opens, "scale still not available: {e}");
                    }
                    self.flag.sleep(self.open_retry).await;
                    continue;
                }
            };

            info!(%target, after_failures = failed_opens, "scale connected");
            failed_opens = 0;
            self.health.set_serial_state(LinkState::Connected);

            match self.read_until_stopped(link.as_mut()).await {
                Ok(()) => break,
                Err(e) => {
                    Health::bump(&self.health.serial_io_errors);
                    self.health.set_serial_state(LinkState::Disconnected);
                    warn!(%target, "scale link lost: {e}");
                    drop(link);
                    self.flag.sleep(self.io_retry).await;
                }
            }
        }

        self.health.set_serial_state(LinkState::Stopped);
        info!(%target, "serial ingestion stopped");
    }

    async fn read_until_stopped(&self, link: &mut dyn ScaleLink) -> Result<(), SerialError> {
        while self.flag.is_running() {
            if let Some(raw) = link.read_frame(self.read_timeout).await? {
                self.handle_frame(&raw);
            }
        }
        Ok(())
    }

    fn handle_frame(&self, raw: &[u8]) {
        let Some(reading) = parse_frame(raw) else {
            Health::bump(&self.health.serial_skipped_frames);
            trace!("blank scale frame");
            return;
        };
        Health::bump(&self.health.serial_frames);
        trace!(text = %reading.text, "scale frame");

        let grams = match reading.grams {
            Ok(g) => Some(g),
            Err(e) => {
                Health::bump(&self.health.serial_parse_failures);
                debug!("keeping last numeric mass: {e}");
                None
            }
        };

        if self.flag.is_running() {
            self.store.update(SensorUpdate::mass(reading.text, grams));
        }
    }
}
