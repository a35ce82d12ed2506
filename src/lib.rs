//! ==============================================================================
//! secador-host - sensor state aggregator for the dryer rig
//! ==============================================================================
//!
//! purpose:
//!     keeps one consistent "current state" of the rig, fed by two channels
//!     that know nothing about each other:
//!     - an mqtt topic carrying json from the environment node (temperatures,
//!       humidities, radiation, thermocouples, fan relays)
//!     - a serial line from the weighing scale (mass, one reading per line)
//!
//! ```text
//!     consumers (csv logger, terminal dashboard) call `snapshot()` whenever
//!     they like and always get a complete, independent copy.
//! ```
//!
//! modules:
//!     - domain.rs     SensorState / SensorUpdate, the fixed schema
//!     - store.rs      mutex-guarded state, update + snapshot
//!     - bus.rs        mqtt ingestion
//!     - serial.rs     scale ingestion with reconnect
//!     - aggregator.rs lifecycle: start / snapshot / stop
//!     - health.rs     link states and failure counters
//!     - config.rs     secador.toml
//!     - error.rs      typed failures
//!
//! ==============================================================================

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod health;
pub mod serial;
pub mod store;

pub use aggregator::{RunFlag, SensorAggregator, SnapshotSource};
pub use config::HostConfig;
pub use domain::{SensorState, SensorUpdate};
pub use error::{AggregatorError, BusError, ParseMassError, SerialError};
pub use health::{HealthReport, LinkState};
pub use store::StateStore;
