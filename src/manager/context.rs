//! Per-attempt handle passed to [`OfflineRequest::perform`](crate::request::OfflineRequest::perform).

use tracing::debug;

use super::OfflineRequestManager;
use crate::model::{UnitId, UnitState};

/// Lets a running unit report progress and re-persist itself.
///
/// Bound to one attempt: once that attempt has finished or timed out, its
/// progress reports are ignored.
#[derive(Clone)]
pub struct RequestContext {
    manager: OfflineRequestManager,
    id: UnitId,
    attempt: u32,
}

impl RequestContext {
    pub(super) fn new(manager: OfflineRequestManager, id: UnitId, attempt: u32) -> Self {
        Self {
            manager,
            id,
            attempt,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    /// 1-based attempt number, counting attempts from before a restart.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report partial progress in [0, 1]. Out-of-range values are clamped.
    pub fn report_progress(&self, progress: f64) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };

        let updated = {
            let mut state = self.manager.inner.state.lock();
            match state.get_mut(&self.id) {
                Some(entry)
                    if entry.state == UnitState::Executing && entry.attempts == self.attempt =>
                {
                    entry.progress = progress;
                    true
                }
                _ => false,
            }
        };

        if updated {
            self.manager.notify_progress();
        } else {
            debug!(id = %self.id, attempt = self.attempt, "ignoring progress from a finished attempt");
        }
    }

    /// Persist the queue again so changes to this unit's record are kept.
    pub async fn save(&self) {
        {
            let mut state = self.manager.inner.state.lock();
            if !state.contains(&self.id) {
                return;
            }
            state.revision += 1;
        }
        self.manager.persist().await;
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .finish()
    }
}
