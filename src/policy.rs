//! Admission and retry policies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::UnitId;
use crate::request::OfflineRequest;

/// External gate deciding whether a unit may attempt execution right now.
///
/// Denial is not an error: the unit stays pending and is reconsidered on the
/// next submission attempt.
pub trait AdmissionPredicate: Send + Sync {
    fn allows(&self, id: UnitId, request: &dyn OfflineRequest) -> bool;
}

impl<F> AdmissionPredicate for F
where
    F: Fn(UnitId, &dyn OfflineRequest) -> bool + Send + Sync,
{
    fn allows(&self, id: UnitId, request: &dyn OfflineRequest) -> bool {
        self(id, request)
    }
}

/// Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AdmissionPredicate for AllowAll {
    fn allows(&self, _id: UnitId, _request: &dyn OfflineRequest) -> bool {
        true
    }
}

/// A shared on/off switch usable as an admission predicate.
///
/// Clones share the same flag, so the host can keep one and hand another to
/// the manager.
#[derive(Debug, Clone)]
pub struct AdmissionSwitch {
    allowed: Arc<AtomicBool>,
}

impl AdmissionSwitch {
    pub fn new(allowed: bool) -> Self {
        Self {
            allowed: Arc::new(AtomicBool::new(allowed)),
        }
    }

    pub fn set(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }
}

impl Default for AdmissionSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AdmissionPredicate for AdmissionSwitch {
    fn allows(&self, _id: UnitId, _request: &dyn OfflineRequest) -> bool {
        self.is_allowed()
    }
}

/// How many failed attempts a unit may accumulate before it is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self { max_attempts: None }
    }

    pub fn limited(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Whether a unit that has failed `attempts` times may run again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_policy_stops_at_ceiling() {
        let policy = RetryPolicy::limited(3);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn default_policy_never_gives_up() {
        assert!(RetryPolicy::default().allows_retry(u32::MAX));
    }

    #[test]
    fn switch_clones_share_state() {
        let switch = AdmissionSwitch::new(true);
        let handed_out = switch.clone();
        switch.set(false);
        assert!(!handed_out.is_allowed());
    }
}
