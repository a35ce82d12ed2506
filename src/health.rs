//! health.rs - link states and failure counters for both ingestion paths.
//!
//! snapshot() never reports failures; this is where they go instead.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// where a channel is in its connect / read / retry cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

#[derive(Debug, Default)]
pub struct Health {
    bus_state: Mutex<LinkState>,
    serial_state: Mutex<LinkState>,

    pub(crate) bus_messages: AtomicU64,
    pub(crate) bus_decode_errors: AtomicU64,
    pub(crate) bus_connect_failures: AtomicU64,

    pub(crate) serial_frames: AtomicU64,
    pub(crate) serial_parse_failures: AtomicU64,
    pub(crate) serial_skipped_frames: AtomicU64,
    pub(crate) serial_open_failures: AtomicU64,
    pub(crate) serial_io_errors: AtomicU64,
}

/// point-in-time copy of `Health`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub bus_state: LinkState,
    pub bus_messages: u64,
    pub bus_decode_errors: u64,
    pub bus_connect_failures: u64,

    pub serial_state: LinkState,
    pub serial_frames: u64,
    pub serial_parse_failures: u64,
    pub serial_skipped_frames: u64,
    pub serial_open_failures: u64,
    pub serial_io_errors: u64,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bus_state(&self, state: LinkState) {
        *lock(&self.bus_state) = state;
    }

    pub fn set_serial_state(&self, state: LinkState) {
        *lock(&self.serial_state) = state;
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> HealthReport {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        HealthReport {
            bus_state: *lock(&self.bus_state),
            bus_messages: get(&self.bus_messages),
            bus_decode_errors: get(&self.bus_decode_errors),
            bus_connect_failures: get(&self.bus_connect_failures),
            serial_state: *lock(&self.serial_state),
            serial_frames: get(&self.serial_frames),
            serial_parse_failures: get(&self.serial_parse_failures),
            serial_skipped_frames: get(&self.serial_skipped_frames),
            serial_open_failures: get(&self.serial_open_failures),
            serial_io_errors: get(&self.serial_io_errors),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
