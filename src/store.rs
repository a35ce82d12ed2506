//! ==============================================================================
//! store.rs - the shared "current state" of the rig
//! ==============================================================================
//!
//! purpose:
//!     one `SensorState` behind a mutex. the bus task and the serial task
//!     write partial updates; the logger and the dashboard take snapshots.
//!
//! rules:
//!     - decoding and parsing happen before `update` is called, never under
//!       the lock.
//!     - the lock is held only for the merge or the clone.
//!     - a poisoned lock is recovered, so a reader can never be made to panic.
//!
//! ==============================================================================

use crate::domain::{SensorState, SensorUpdate};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct StateStore {
    state: Mutex<SensorState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// merge the present fields of `update`; returns how many were written
    pub fn update(&self, update: SensorUpdate) -> usize {
        self.lock().apply(update)
    }

    /// independent copy of the state as of the last completed update
    pub fn snapshot(&self) -> SensorState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, SensorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
