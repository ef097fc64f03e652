//! Core data model.
//!
//! A unit is a piece of deferred network work. It has identity, a persisted
//! record of primitive values, an attempt count, and lifecycle state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for unit IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Queued, waiting for admission and connectivity.
    Pending,
    /// An attempt is in flight.
    Executing,
    /// Finished successfully and removed from the queue. Terminal.
    Completed,
    /// The last attempt failed; about to return to pending or be dropped.
    Failed,
    /// Removed without completing (retries exhausted, vetoed, or cleared). Terminal.
    Dropped,
}

impl UnitState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, to),
            (Pending, Executing)
                | (Pending, Dropped)   // cleared
                | (Executing, Completed)
                | (Executing, Failed)
                | (Failed, Pending)    // retry
                | (Failed, Dropped) // retries exhausted or vetoed
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Completed | UnitState::Dropped)
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitState::Pending => "pending",
            UnitState::Executing => "executing",
            UnitState::Completed => "completed",
            UnitState::Failed => "failed",
            UnitState::Dropped => "dropped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A primitive value inside a persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Primitive {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Primitive::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Primitive::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Primitive::Int(n) => Some(*n as f64),
            Primitive::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Primitive::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Primitive {
    fn from(value: bool) -> Self {
        Primitive::Bool(value)
    }
}

impl From<i64> for Primitive {
    fn from(value: i64) -> Self {
        Primitive::Int(value)
    }
}

impl From<i32> for Primitive {
    fn from(value: i32) -> Self {
        Primitive::Int(value.into())
    }
}

impl From<u32> for Primitive {
    fn from(value: u32) -> Self {
        Primitive::Int(value.into())
    }
}

impl From<f64> for Primitive {
    fn from(value: f64) -> Self {
        Primitive::Float(value)
    }
}

impl From<&str> for Primitive {
    fn from(value: &str) -> Self {
        Primitive::Text(value.to_string())
    }
}

impl From<String> for Primitive {
    fn from(value: String) -> Self {
        Primitive::Text(value)
    }
}

/// Serialized state of a unit: string keys to primitive values.
pub type Record = BTreeMap<String, Primitive>;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Point-in-time view of a queued unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub id: UnitId,
    pub state: UnitState,
    /// Fraction in [0, 1]; only moves while executing.
    pub progress: f64,
    /// Attempts started so far, including restored ones.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}
