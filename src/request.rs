//! The unit-of-work contract.
//!
//! An [`OfflineRequest`] is opaque to the manager: it knows how to describe
//! itself as a [`Record`] and how to perform its remote work. A
//! [`UnitFactory`] turns stored records back into requests after a restart.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, RequestError};
use crate::manager::RequestContext;
use crate::model::Record;

/// A queued, retryable, persistable piece of deferred work.
#[async_trait]
pub trait OfflineRequest: Send + Sync {
    /// Record used to persist this unit. `None` keeps the unit in memory only.
    fn to_record(&self) -> Option<Record>;

    /// Perform the remote work.
    ///
    /// Report partial progress through `ctx`. Returning resolves the attempt:
    /// `Ok` completes the unit, `Err` returns it to the queue (subject to
    /// [`should_attempt_resubmission`](Self::should_attempt_resubmission) and
    /// the manager's retry policy).
    async fn perform(&self, ctx: RequestContext) -> Result<(), RequestError>;

    /// Whether a failed unit should be queued again.
    fn should_attempt_resubmission(&self, _error: &Error) -> bool {
        true
    }
}

/// Rebuilds requests from stored records.
pub trait UnitFactory: Send + Sync {
    /// `None` means the record is unreconstructable and the unit is dropped.
    fn from_record(&self, record: &Record) -> Option<Arc<dyn OfflineRequest>>;
}

impl<F> UnitFactory for F
where
    F: Fn(&Record) -> Option<Arc<dyn OfflineRequest>> + Send + Sync,
{
    fn from_record(&self, record: &Record) -> Option<Arc<dyn OfflineRequest>> {
        self(record)
    }
}
