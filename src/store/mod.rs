//! Durable storage for the pending queue.
//!
//! The manager only ever loads the whole ordered queue at start-up and saves
//! the whole ordered queue after a mutation. Backends decide how to lay it
//! out on disk.

pub mod json;
pub mod memory;
pub mod sqlite;

pub use json::JsonFileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Record, UnitId};

/// One persisted entry of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUnit {
    pub id: UnitId,
    /// Attempts started before the snapshot was taken.
    #[serde(default)]
    pub attempts: u32,
    pub record: Record,
    pub enqueued_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Load the queue in FIFO order. Fails on an unreadable or corrupt store.
    async fn load(&self) -> Result<Vec<StoredUnit>>;

    /// Replace the stored queue with `units`, in order.
    async fn save(&self, units: &[StoredUnit]) -> Result<()>;
}
