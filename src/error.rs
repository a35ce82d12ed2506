//! ==============================================================================
//! error.rs - typed failures for the ingestion paths
//! ==============================================================================
//!
//! purpose:
//!     every failure an ingestion loop can hit is a value here. the loops log
//!     it, count it in health.rs, and carry on. none of these ever reach a
//!     caller of snapshot().
//!
//! relationships:
//!     - used by: bus.rs, serial.rs, aggregator.rs
//!
//! ==============================================================================

use thiserror::Error;

/// failures on the publish/subscribe side
#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("subscription to {topic} rejected by broker")]
    SubscribeRejected { topic: String },

    #[error("bus source closed")]
    Closed,

    #[error("payload is not valid json: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("payload is json but not an object")]
    NotAnObject,
}

/// failures on the scale's serial link
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("serial read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial device disconnected")]
    Disconnected,
}

/// why a scale frame did not yield a number
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseMassError {
    #[error("frame is empty")]
    Empty,

    #[error("not a number: {0:?}")]
    NotNumeric(String),

    #[error("number is not finite: {0:?}")]
    NotFinite(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("aggregator already started")]
    AlreadyStarted,
}
