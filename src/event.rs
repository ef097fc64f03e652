//! Structured events emitted by the manager on every state transition.
//!
//! Consumers subscribe to the event stream to build dashboards or audit
//! logs. Events are the manager's voice; the observer is the host's UI hook.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::UnitId;

/// Buffered events per subscriber before lagging receivers skip ahead.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// A structured event emitted by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    UnitQueued {
        id: UnitId,
    },
    UnitRestored {
        id: UnitId,
        attempts: u32,
    },
    UnitStarted {
        id: UnitId,
        attempt: u32,
    },
    UnitCompleted {
        id: UnitId,
        attempt: u32,
        duration_ms: u64,
    },
    UnitFailed {
        id: UnitId,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    UnitDropped {
        id: UnitId,
        reason: DropReason,
    },
    ConnectivityChanged {
        connected: bool,
    },
    PersistenceFailed {
        error: String,
    },
}

/// Why a unit left the queue without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The stored record could not be turned back into a request.
    Unreconstructable,
    /// The retry policy's attempt ceiling was reached.
    RetriesExhausted,
    /// The request declined resubmission after a failure.
    ResubmissionDeclined,
    /// Removed by `clear_pending`.
    Cleared,
}

/// Sequenced broadcast of events.
pub(crate) struct EventBus {
    seq: std::sync::atomic::AtomicU64,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            seq: std::sync::atomic::AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind) {
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        // No subscribers is fine.
        let _ = self.tx.send(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}
