//! In-process store. Nothing survives the process; handy for tests and for
//! hosts that only want the retry machinery.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PersistenceStore, StoredUnit};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    units: Mutex<Vec<StoredUnit>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot, as if written by an earlier process.
    pub fn with_units(units: Vec<StoredUnit>) -> Self {
        Self {
            units: Mutex::new(units),
            ..Self::default()
        }
    }

    /// The last successfully saved queue.
    pub fn snapshot(&self) -> Vec<StoredUnit> {
        self.units.lock().clone()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent loads fail, simulating a corrupt store.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent saves fail, simulating a full or read-only disk.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load(&self) -> Result<Vec<StoredUnit>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Error::Persistence("memory store marked unreadable".into()));
        }
        Ok(self.units.lock().clone())
    }

    async fn save(&self, units: &[StoredUnit]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Persistence("memory store rejected write".into()));
        }
        *self.units.lock() = units.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
