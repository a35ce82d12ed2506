//! ==============================================================================
//! aggregator.rs - lifecycle of the two ingestion paths
//! ==============================================================================
//!
//! purpose:
//!     owns the store, the health counters and the run flag; spawns the bus
//!     task and the serial task; hands out snapshots to whoever asks.
//!
//! architecture:
//!
//! ```text
//!     ┌──────────────┐          ┌──────────────┐
//!     │  bus task    │          │ serial task  │
//!     │ (mqtt json)  │          │ (scale line) │
//!     └──────┬───────┘          └──────┬───────┘
//!            │  update()               │  update()
//!            └──────────┬──────────────┘
//!                 ┌─────┴─────┐
//!                 │StateStore │ <- store.rs (mutex)
//!                 └─────┬─────┘
//!                       │ snapshot()
//!              logger / dashboard / main.rs
//! ```
//!
//! shutdown:
//!     stop() clears the RunFlag, wakes any backoff sleep, and waits for both
//!     tasks to finish, so the serial port is closed when it returns.
//!
//! ==============================================================================

use crate::bus::{BusChannel, BusSource, MqttSource};
use crate::config::HostConfig;
use crate::domain::SensorState;
use crate::error::AggregatorError;
use crate::health::{Health, HealthReport};
use crate::serial::{ScaleConnector, SerialIngest, TokioSerialConnector};
use crate::store::StateStore;

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ==============================================================================
// run flag
// ==============================================================================

/// shared "keep going" flag for the ingestion loops
#[derive(Debug)]
pub struct RunFlag {
    running: AtomicBool,
    wake: Notify,
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            wake: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// resolves once `stop` has been called
    pub async fn stopped(&self) {
        loop {
            let mut notified = pin!(self.wake.notified());
            // register before checking, so a stop in between is not missed
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    /// sleep for `duration`, returning early on stop.
    /// returns whether the flag is still set.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = self.stopped() => false,
        }
    }
}

// ==============================================================================
// snapshot contract
// ==============================================================================

/// read side offered to the logger and the dashboard
pub trait SnapshotSource {
    /// fully populated, independent copy of the current state
    fn snapshot(&self) -> SensorState;
}

impl SnapshotSource for StateStore {
    fn snapshot(&self) -> SensorState {
        StateStore::snapshot(self)
    }
}

// ==============================================================================
// aggregator
// ==============================================================================

pub struct SensorAggregator {
    config: HostConfig,
    store: Arc<StateStore>,
    health: Arc<Health>,
    flag: Arc<RunFlag>,
    bus_source: Option<Box<dyn BusSource>>,
    scale: Arc<dyn ScaleConnector>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl SensorAggregator {
    /// aggregator talking to the real broker and serial port
    pub fn new(config: HostConfig) -> Self {
        let bus = Box::new(MqttSource::new(&config.bus));
        let scale = Arc::new(TokioSerialConnector::new(&config.serial));
        Self::with_transports(config, bus, scale)
    }

    pub fn with_transports(
        config: HostConfig,
        bus_source: Box<dyn BusSource>,
        scale: Arc<dyn ScaleConnector>,
    ) -> Self {
        Self {
            config,
            store: Arc::new(StateStore::new()),
            health: Arc::new(Health::new()),
            flag: Arc::new(RunFlag::new()),
            bus_source: Some(bus_source),
            scale,
            tasks: Vec::new(),
            started: false,
        }
    }

    /// spawn both ingestion tasks. must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), AggregatorError> {
        let bus_source = match self.bus_source.take() {
            Some(source) if !self.started => source,
            _ => return Err(AggregatorError::AlreadyStarted),
        };
        self.started = true;

        info!(
            broker = %format!("{}:{}", self.config.bus.host, self.config.bus.port),
            topic = %self.config.bus.topic,
            scale = %self.scale.describe(),
            "starting sensor aggregator"
        );

        let bus = BusChannel::new(
            &self.config.bus,
            bus_source,
            self.store.clone(),
            self.health.clone(),
            self.flag.clone(),
        );
        let serial = SerialIngest::new(
            &self.config.serial,
            self.scale.clone(),
            self.store.clone(),
            self.health.clone(),
            self.flag.clone(),
        );

        self.tasks.push(tokio::spawn(bus.run()));
        self.tasks.push(tokio::spawn(serial.run()));
        Ok(())
    }

    /// stop both tasks and wait for them to exit. safe to call twice.
    pub async fn stop(&mut self) {
        self.flag.stop();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("ingestion task ended abnormally: {e}");
            }
        }
        info!("sensor aggregator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started && self.flag.is_running()
    }

    pub fn snapshot(&self) -> SensorState {
        self.store.snapshot()
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    /// shareable read handle, for consumers living on other tasks or threads
    pub fn reader(&self) -> Arc<StateStore> {
        self.store.clone()
    }
}

impl SnapshotSource for SensorAggregator {
    fn snapshot(&self) -> SensorState {
        SensorAggregator::snapshot(self)
    }
}

impl Drop for SensorAggregator {
    fn drop(&mut self) {
        // tasks notice the flag and wind down on their own
        self.flag.stop();
    }
}
