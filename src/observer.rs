//! Push notifications from the manager to the embedding application.
//!
//! Every method has a no-op default so implementers only override what they
//! display. Calls arrive on runtime worker threads, never under a manager lock.

use crate::error::Error;
use crate::model::UnitId;
use crate::request::OfflineRequest;

pub trait QueueObserver: Send + Sync {
    /// Aggregate progress changed. Rapid updates are coalesced.
    fn on_progress(&self, _progress: f64) {}

    fn on_connectivity_change(&self, _connected: bool) {}

    fn on_unit_started(&self, _id: UnitId, _request: &dyn OfflineRequest) {}

    fn on_unit_completed(&self, _id: UnitId, _request: &dyn OfflineRequest) {}

    fn on_unit_failed(&self, _id: UnitId, _request: &dyn OfflineRequest, _error: &Error) {}

    /// The persisted queue could not be read or written.
    fn on_persistence_error(&self, _error: &Error) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl QueueObserver for NoopObserver {}
