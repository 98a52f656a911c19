use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{LinkAddress, Reading};

/// Shared record of the latest reading and link address.
///
/// Each record sits behind its own lock. Writers replace the whole record and
/// readers copy it out, so a reader never sees fields from two different
/// writes and the lock is held only for the duration of a record copy.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    reading: Mutex<Reading>,
    address: Mutex<LinkAddress>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_reading(&self, reading: Reading) {
        *lock(&self.reading) = reading;
    }

    pub fn read_reading(&self) -> Reading {
        *lock(&self.reading)
    }

    pub fn write_address(&self, address: LinkAddress) {
        *lock(&self.address) = address;
    }

    pub fn read_address(&self) -> LinkAddress {
        *lock(&self.address)
    }
}

// Records are plain `Copy` data written in one assignment; a panic elsewhere
// while holding the guard cannot leave one half-written.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
