//! SQLite store.
//!
//! One ordered table holds the queue. WAL mode so an inspecting process can
//! read while the manager writes. Every save rewrites the table inside a
//! single transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};

use super::{PersistenceStore, StoredUnit};
use crate::error::{Error, Result};
use crate::model::{Record, UnitId};

/// Storage backend. Owns the SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("conn", &"<Mutex<Connection>>")
            .finish()
    }
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS units (
                position     INTEGER PRIMARY KEY,
                id           TEXT NOT NULL UNIQUE,
                attempts     INTEGER NOT NULL DEFAULT 0,
                record       TEXT NOT NULL,
                enqueued_at  TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Persistence(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn load(&self) -> Result<Vec<StoredUnit>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, attempts, record, enqueued_at FROM units ORDER BY position ASC",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, attempts, record, enqueued_at)| {
                    row_to_unit(&id, attempts, &record, &enqueued_at)
                })
                .collect()
        })
        .await
    }

    async fn save(&self, units: &[StoredUnit]) -> Result<()> {
        let units = units.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM units", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO units (position, id, attempts, record, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (position, unit) in units.iter().enumerate() {
                    stmt.execute(params![
                        position as i64,
                        unit.id.0.to_string(),
                        unit.attempts,
                        serde_json::to_string(&unit.record)?,
                        unit.enqueued_at.to_rfc3339(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_unit(id: &str, attempts: u32, record: &str, enqueued_at: &str) -> Result<StoredUnit> {
    let id = id
        .parse()
        .map(UnitId)
        .map_err(|e: uuid::Error| Error::Persistence(format!("bad unit id {id:?}: {e}")))?;
    let record: Record = serde_json::from_str(record)
        .map_err(|e| Error::Persistence(format!("bad record for unit {id}: {e}")))?;
    let enqueued_at = enqueued_at
        .parse::<DateTime<Utc>>()
        .map_err(|e| Error::Persistence(format!("bad enqueued_at for unit {id}: {e}")))?;

    Ok(StoredUnit {
        id,
        attempts,
        record,
        enqueued_at,
    })
}
