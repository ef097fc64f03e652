//! In-memory queue state owned by the manager.
//!
//! Everything here is synchronous and runs under the manager's state lock.
//! FIFO order is kept in a `VecDeque` of ids; entries are looked up by id.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{UnitId, UnitSnapshot, UnitState};
use crate::request::OfflineRequest;
use crate::store::StoredUnit;

pub(crate) struct Entry {
    pub request: Arc<dyn OfflineRequest>,
    pub state: UnitState,
    pub progress: f64,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Set after a failed attempt; the unit sits out internal re-triggers
    /// until the next external submission attempt.
    pub retry_held: bool,
}

impl Entry {
    pub fn new(request: Arc<dyn OfflineRequest>, attempts: u32, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            request,
            state: UnitState::Pending,
            progress: 0.0,
            attempts,
            enqueued_at,
            retry_held: false,
        }
    }

    /// Move to `to`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: UnitState) -> Result<UnitState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        self.state = to;
        Ok(from)
    }
}

#[derive(Default)]
pub(crate) struct QueueState {
    order: VecDeque<UnitId>,
    entries: HashMap<UnitId, Entry>,
    /// Units that finished successfully.
    pub completed: u64,
    /// Units that left the queue without completing.
    pub dropped: u64,
    /// Every unit ever enqueued or restored.
    pub total: u64,
    /// Bumped on every change that affects the persisted snapshot.
    pub revision: u64,
    /// Highest revision known to be on disk.
    pub saved_revision: u64,
}

impl QueueState {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &UnitId) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &UnitId) -> Option<&mut Entry> {
        self.entries.get_mut(id)
    }

    /// Append at the tail.
    pub fn push(&mut self, id: UnitId, entry: Entry) {
        self.entries.insert(id, entry);
        self.order.push_back(id);
        self.total += 1;
        self.revision += 1;
    }

    /// Remove a unit wherever it sits in the queue.
    pub fn remove(&mut self, id: &UnitId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        if let Some(pos) = self.order.iter().position(|queued| queued == id) {
            self.order.remove(pos);
        }
        self.revision += 1;
        Some(entry)
    }

    /// Take a unit that reached a terminal state out of the queue and count
    /// its outcome. Units still in flight or queued are left alone.
    pub fn retire(&mut self, id: &UnitId) -> Option<Entry> {
        if !self.entries.get(id)?.state.is_terminal() {
            return None;
        }
        let entry = self.remove(id)?;
        if entry.state == UnitState::Completed {
            self.completed += 1;
        } else {
            self.dropped += 1;
        }
        Some(entry)
    }

    pub fn executing_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == UnitState::Executing)
            .count()
    }

    /// Pending units not held back after a failure, in FIFO order.
    pub fn eligible(&self) -> Vec<(UnitId, Arc<dyn OfflineRequest>)> {
        self.order
            .iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                (entry.state == UnitState::Pending && !entry.retry_held)
                    .then(|| (*id, Arc::clone(&entry.request)))
            })
            .collect()
    }

    /// Remove every pending unit, leaving executing ones in place.
    pub fn drain_pending(&mut self) -> Vec<(UnitId, Entry)> {
        let ids: Vec<UnitId> = self
            .order
            .iter()
            .filter(|id| {
                self.entries
                    .get(*id)
                    .is_some_and(|e| e.state == UnitState::Pending)
            })
            .copied()
            .collect();

        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                // Pending -> Dropped is always allowed.
                let _ = entry.transition(UnitState::Dropped);
            }
            if let Some(entry) = self.retire(&id) {
                drained.push((id, entry));
            }
        }
        drained
    }

    /// Aggregate progress across every unit this queue has known.
    ///
    /// Completed and dropped units count as 1.0, queued units as their own
    /// progress (0.0 until started). Recomputed from scratch on each call.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let finished = (self.completed + self.dropped) as f64;
        let in_queue: f64 = self.entries.values().map(|e| e.progress).sum();
        ((finished + in_queue) / self.total as f64).clamp(0.0, 1.0)
    }

    pub fn snapshots(&self) -> Vec<UnitSnapshot> {
        self.order
            .iter()
            .filter_map(|id| {
                self.entries.get(id).map(|e| UnitSnapshot {
                    id: *id,
                    state: e.state,
                    progress: e.progress,
                    attempts: e.attempts,
                    enqueued_at: e.enqueued_at,
                })
            })
            .collect()
    }

    /// Units to persist, in FIFO order.
    ///
    /// Executing units are included as plain entries: after a crash they come
    /// back pending. Records are produced later by [`to_stored`], outside the
    /// state lock.
    pub fn persistable(&self) -> Vec<Persistable> {
        self.order
            .iter()
            .filter_map(|id| {
                self.entries.get(id).map(|entry| Persistable {
                    id: *id,
                    attempts: entry.attempts,
                    enqueued_at: entry.enqueued_at,
                    request: Arc::clone(&entry.request),
                })
            })
            .collect()
    }

    /// Clear every retry hold so failed units become eligible again.
    pub fn release_holds(&mut self) {
        for entry in self.entries.values_mut() {
            entry.retry_held = false;
        }
    }
}

pub(crate) struct Persistable {
    id: UnitId,
    attempts: u32,
    enqueued_at: DateTime<Utc>,
    request: Arc<dyn OfflineRequest>,
}

/// Build the stored form. Memory-only units (no record) are skipped.
pub(crate) fn to_stored(units: Vec<Persistable>) -> Vec<StoredUnit> {
    units
        .into_iter()
        .filter_map(|unit| {
            let record = unit.request.to_record()?;
            Some(StoredUnit {
                id: unit.id,
                attempts: unit.attempts,
                record,
                enqueued_at: unit.enqueued_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestError;
    use crate::manager::RequestContext;
    use crate::model::Record;
    use async_trait::async_trait;

    struct Stub(Option<Record>);

    #[async_trait]
    impl OfflineRequest for Stub {
        fn to_record(&self) -> Option<Record> {
            self.0.clone()
        }

        async fn perform(&self, _ctx: RequestContext) -> std::result::Result<(), RequestError> {
            Ok(())
        }
    }

    fn entry(record: Option<Record>) -> Entry {
        Entry::new(Arc::new(Stub(record)), 0, Utc::now())
    }

    #[test]
    fn progress_is_mean_over_known_units() {
        let mut state = QueueState::default();
        let done = UnitId::new();
        let half = UnitId::new();
        let fresh = UnitId::new();
        state.push(done, entry(None));
        state.push(half, entry(None));
        state.push(fresh, entry(None));

        state.remove(&done);
        state.completed += 1;
        state.get_mut(&half).unwrap().progress = 0.5;

        assert!((state.progress() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_queue_reports_full_progress() {
        assert_eq!(QueueState::default().progress(), 1.0);
    }

    #[test]
    fn remove_keeps_fifo_order_of_the_rest() {
        let mut state = QueueState::default();
        let ids: Vec<UnitId> = (0..4).map(|_| UnitId::new()).collect();
        for id in &ids {
            state.push(*id, entry(None));
        }
        state.remove(&ids[1]);

        let pending: Vec<UnitId> = state.eligible().into_iter().map(|(id, _)| id).collect();
        assert_eq!(pending, vec![ids[0], ids[2], ids[3]]);
    }

    #[test]
    fn memory_only_units_are_not_persisted() {
        let mut state = QueueState::default();
        let kept = UnitId::new();
        state.push(kept, entry(Some(Record::new())));
        state.push(UnitId::new(), entry(None));

        let stored = to_stored(state.persistable());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, kept);
    }

    #[test]
    fn drain_pending_skips_executing_units() {
        let mut state = QueueState::default();
        let running = UnitId::new();
        state.push(running, entry(None));
        state.push(UnitId::new(), entry(None));
        state
            .get_mut(&running)
            .unwrap()
            .transition(UnitState::Executing)
            .unwrap();

        let drained = state.drain_pending();
        assert_eq!(drained.len(), 1);
        assert_eq!(state.len(), 1);
        assert!(state.contains(&running));
        assert_eq!(state.dropped, 1);
    }

    #[test]
    fn retire_only_takes_terminal_units() {
        let mut state = QueueState::default();
        let id = UnitId::new();
        state.push(id, entry(None));

        assert!(state.retire(&id).is_none());
        state
            .get_mut(&id)
            .unwrap()
            .transition(UnitState::Executing)
            .unwrap();
        assert!(state.retire(&id).is_none());

        state
            .get_mut(&id)
            .unwrap()
            .transition(UnitState::Completed)
            .unwrap();
        assert!(state.retire(&id).is_some());
        assert_eq!(state.completed, 1);
        assert_eq!(state.dropped, 0);
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn held_units_wait_for_release() {
        let mut state = QueueState::default();
        let failed = UnitId::new();
        state.push(failed, entry(None));
        state.get_mut(&failed).unwrap().retry_held = true;
        assert!(state.eligible().is_empty());

        state.release_holds();
        assert_eq!(state.eligible().len(), 1);
    }

    #[test]
    fn double_start_is_rejected() {
        let mut e = entry(None);
        e.transition(UnitState::Executing).unwrap();
        assert!(matches!(
            e.transition(UnitState::Executing),
            Err(Error::InvalidTransition { .. })
        ));
    }
}
