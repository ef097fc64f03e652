//! Throttled dispatch of blocks with explicit completion acknowledgment.
//!
//! A block counts against its context's capacity from the moment it is
//! dispatched until the caller acknowledges it with
//! [`Throttler::mark_block_done`]. Running the block does not free capacity;
//! the real work may finish much later. Blocks scheduled while a lane is full
//! wait in arrival order.
//!
//! Each lane hands blocks to its context in the order they were granted a
//! slot, even when acknowledgments arrive concurrently from many threads.
//! Whichever caller first finds work for an idle lane drains it; others only
//! enqueue.

mod context;

pub use context::{Block, ExecutionContext, InlineContext, SerialContext, TokioContext};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::debug;

use crate::telemetry::metrics;

/// Identifier of a scheduled block, unique for the life of its throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action-{}", self.0)
    }
}

type Hook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct HookSlot {
    called: bool,
    hook: Option<Hook>,
}

/// Handle returned by [`Throttler::execute`].
#[derive(Clone)]
pub struct ScheduledAction {
    id: ActionId,
    slot: Arc<Mutex<HookSlot>>,
    throttler: Throttler,
}

impl ScheduledAction {
    pub fn identifier(&self) -> ActionId {
        self.id
    }

    /// Register a hook that runs right after the throttler runs the block.
    ///
    /// If the block has already run, the hook runs now on the calling
    /// thread. Registering again replaces a hook that has not fired yet.
    pub fn on_block_called(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self.slot.lock();
        if slot.called {
            drop(slot);
            hook();
        } else {
            slot.hook = Some(Box::new(hook));
        }
    }

    /// Whether the block has run.
    pub fn was_called(&self) -> bool {
        self.slot.lock().called
    }

    /// Shorthand for [`Throttler::mark_block_done`] with this identifier.
    pub fn mark_done(&self) {
        self.throttler.mark_block_done(self.id);
    }
}

impl fmt::Debug for ScheduledAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledAction")
            .field("id", &self.id)
            .field("called", &self.was_called())
            .finish()
    }
}

struct Job {
    id: ActionId,
    context: Arc<dyn ExecutionContext>,
    block: Block,
    slot: Arc<Mutex<HookSlot>>,
}

#[derive(Default)]
struct Lane {
    /// Granted a slot and not yet acknowledged.
    running: usize,
    deferred: VecDeque<Job>,
    /// Granted a slot, waiting to be handed to the context.
    ready: VecDeque<Job>,
    /// Some caller is handing `ready` jobs to the context.
    draining: bool,
}

impl Lane {
    /// Queue a granted job. Returns true when the caller must drain.
    fn grant(&mut self, job: Job) -> bool {
        self.ready.push_back(job);
        !std::mem::replace(&mut self.draining, true)
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.deferred.is_empty() && self.ready.is_empty() && !self.draining
    }
}

#[derive(Default)]
struct ThrottleState {
    next_id: u64,
    lanes: HashMap<String, Lane>,
    /// Dispatched blocks awaiting acknowledgment, by lane label.
    outstanding: HashMap<ActionId, String>,
}

struct Shared {
    capacity: usize,
    state: Mutex<ThrottleState>,
}

/// Bounds how many blocks may be outstanding per execution context.
///
/// Cloning yields another handle to the same throttler.
#[derive(Clone)]
pub struct Throttler {
    inner: Arc<Shared>,
}

impl Throttler {
    /// `capacity` is the per-context limit; zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Shared {
                capacity: capacity.max(1),
                state: Mutex::new(ThrottleState::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Schedule `block` on `context`, dispatching now if the lane has room.
    pub fn execute(
        &self,
        context: Arc<dyn ExecutionContext>,
        block: impl FnOnce() + Send + 'static,
    ) -> ScheduledAction {
        let slot = Arc::new(Mutex::new(HookSlot::default()));
        let label = context.label().to_string();

        let (id, drain) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.next_id += 1;
            let id = ActionId(state.next_id);
            let job = Job {
                id,
                context,
                block: Box::new(block),
                slot: Arc::clone(&slot),
            };

            let lane = state.lanes.entry(label.clone()).or_default();
            if lane.running < self.inner.capacity {
                lane.running += 1;
                state.outstanding.insert(id, label.clone());
                (id, lane.grant(job))
            } else {
                lane.deferred.push_back(job);
                debug!(%id, context = %label, deferred = lane.deferred.len(), "lane full, block deferred");
                (id, false)
            }
        };

        if drain {
            self.drain(&label);
        }

        ScheduledAction {
            id,
            slot,
            throttler: self.clone(),
        }
    }

    /// Acknowledge that the block for `id` has fully finished, freeing its
    /// slot for the next deferred block on the same context.
    ///
    /// Unknown, deferred and already-acknowledged identifiers are ignored.
    pub fn mark_block_done(&self, id: ActionId) {
        let drain = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(label) = state.outstanding.remove(&id) else {
                debug!(%id, "ignoring done for a block that is not outstanding");
                return;
            };

            let Some(lane) = state.lanes.get_mut(&label) else {
                return;
            };
            match lane.deferred.pop_front() {
                Some(job) => {
                    // The freed slot passes straight to the next block.
                    state.outstanding.insert(job.id, label.clone());
                    lane.grant(job).then_some(label)
                }
                None => {
                    lane.running = lane.running.saturating_sub(1);
                    if lane.is_idle() {
                        state.lanes.remove(&label);
                    }
                    None
                }
            }
        };

        debug!(%id, "block done");
        if let Some(label) = drain {
            self.drain(&label);
        }
    }

    /// Dispatched blocks on `label` awaiting acknowledgment.
    pub fn outstanding_count(&self, label: &str) -> usize {
        self.inner
            .state
            .lock()
            .lanes
            .get(label)
            .map_or(0, |lane| lane.running)
    }

    /// Blocks on `label` waiting for capacity.
    pub fn deferred_count(&self, label: &str) -> usize {
        self.inner
            .state
            .lock()
            .lanes
            .get(label)
            .map_or(0, |lane| lane.deferred.len())
    }

    /// Whether `id` has been dispatched and not yet acknowledged.
    pub fn is_outstanding(&self, id: ActionId) -> bool {
        self.inner.state.lock().outstanding.contains_key(&id)
    }

    /// Hand the lane's granted jobs to their context, oldest first, until none
    /// are left. Only the caller that set `draining` runs this.
    fn drain(&self, label: &str) {
        loop {
            let job = {
                let mut guard = self.inner.state.lock();
                let state = &mut *guard;
                let Some(lane) = state.lanes.get_mut(label) else {
                    return;
                };
                match lane.ready.pop_front() {
                    Some(job) => job,
                    None => {
                        lane.draining = false;
                        if lane.is_idle() {
                            state.lanes.remove(label);
                        }
                        return;
                    }
                }
            };
            self.dispatch(job);
        }
    }

    /// Hand a job to its context. Never called with the state lock held.
    fn dispatch(&self, job: Job) {
        let Job {
            id,
            context,
            block,
            slot,
        } = job;

        debug!(%id, context = context.label(), "dispatching block");
        metrics::throttle_dispatches().add(1, &[KeyValue::new("context", context.label().to_string())]);

        context.dispatch(Box::new(move || {
            block();
            let hook = {
                let mut slot = slot.lock();
                slot.called = true;
                slot.hook.take()
            };
            if let Some(hook) = hook {
                hook();
            }
        }));
    }
}

impl fmt::Debug for Throttler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Throttler")
            .field("capacity", &self.inner.capacity)
            .field("outstanding", &state.outstanding.len())
            .finish()
    }
}
