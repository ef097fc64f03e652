//! Error types for outbox-rs.

use std::time::Duration;

use thiserror::Error;

use crate::model::{UnitId, UnitState};

/// Error produced by a unit's own `perform` operation.
pub type RequestError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unit {id} failed: {source}")]
    UnitExecutionFailed {
        id: UnitId,
        #[source]
        source: RequestError,
    },

    #[error("unit {id} exceeded its time limit of {limit:?}")]
    TimedOut { id: UnitId, limit: Duration },

    #[error("unit {id} could not be reconstructed from its stored record")]
    ReconstructionFailed { id: UnitId },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: UnitState, to: UnitState },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors raised while reading or writing the persisted queue.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_) | Error::Io(_) | Error::Json(_) | Error::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
