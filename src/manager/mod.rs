//! The offline request manager.
//!
//! Single authoritative owner of the pending queue. Producers enqueue from
//! any thread; a driver task re-attempts submission periodically and when
//! connectivity returns; every finished attempt immediately tries the next
//! eligible units. All queue mutations happen under one lock and every
//! mutation is followed by a persisted snapshot.

mod context;
mod driver;
mod progress;
mod queue;

pub use context::RequestContext;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::connectivity::{ConnectivityMonitor, ConnectivitySignal};
use crate::error::{Error, Result};
use crate::event::{DropReason, Event, EventBus, EventKind};
use crate::model::{UnitId, UnitSnapshot, UnitState};
use crate::observer::{NoopObserver, QueueObserver};
use crate::policy::{AdmissionPredicate, AllowAll, RetryPolicy};
use crate::request::{OfflineRequest, UnitFactory};
use crate::store::PersistenceStore;
use crate::telemetry::metrics;
use crate::telemetry::unit::{record_state_transition, start_unit_span};

use progress::{Gate, ProgressGate};
use queue::{Entry, QueueState, to_stored};

/// Configuration for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Period of the automatic submission attempt.
    pub submission_interval: Duration,
    /// Cap on simultaneous attempts. `None` means no cap.
    pub max_concurrent: Option<usize>,
    /// An attempt running longer than this is aborted and counted as failed.
    /// `None` lets attempts run for as long as they need.
    pub request_time_limit: Option<Duration>,
    /// Minimum spacing between progress notifications to the observer.
    pub progress_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            submission_interval: Duration::from_secs(10),
            max_concurrent: Some(10),
            request_time_limit: None,
            progress_interval: Duration::from_millis(100),
            retry: RetryPolicy::unlimited(),
        }
    }
}

/// Handle to a running manager. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct OfflineRequestManager {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    store: Arc<dyn PersistenceStore>,
    factory: Arc<dyn UnitFactory>,
    admission: Arc<dyn AdmissionPredicate>,
    observer: Arc<dyn QueueObserver>,
    connectivity: Arc<dyn ConnectivitySignal>,
    config: ManagerConfig,
    runtime: Handle,
    /// Serializes writes to the store so snapshots land in order.
    persist_lock: tokio::sync::Mutex<()>,
    progress: ProgressGate,
    events: EventBus,
    shutdown: Notify,
    stopped: AtomicBool,
}

/// Outcome of a failed attempt.
enum Disposition {
    Requeued,
    Dropped(DropReason),
}

/// Builder for [`OfflineRequestManager`].
pub struct ManagerBuilder {
    store: Arc<dyn PersistenceStore>,
    factory: Arc<dyn UnitFactory>,
    admission: Arc<dyn AdmissionPredicate>,
    observer: Arc<dyn QueueObserver>,
    connectivity: Arc<dyn ConnectivitySignal>,
    config: ManagerConfig,
}

impl ManagerBuilder {
    pub fn admission(mut self, admission: Arc<dyn AdmissionPredicate>) -> Self {
        self.admission = admission;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivitySignal>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Restore the persisted queue, start the driver and kick a first
    /// submission attempt.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime or with a zero submission
    /// interval. An unreadable store is reported, not returned.
    pub async fn start(self) -> Result<OfflineRequestManager> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::Other("the manager must be started inside a tokio runtime".into()))?;
        if self.config.submission_interval.is_zero() {
            return Err(Error::Config("submission interval must be non-zero".into()));
        }
        let connectivity_changes = self.connectivity.watch();

        let manager = OfflineRequestManager {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                store: self.store,
                factory: self.factory,
                admission: self.admission,
                observer: self.observer,
                connectivity: self.connectivity,
                progress: ProgressGate::new(self.config.progress_interval),
                config: self.config,
                runtime,
                persist_lock: tokio::sync::Mutex::new(()),
                events: EventBus::new(),
                shutdown: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
        };

        manager.restore().await;

        let driver = manager.clone();
        manager.inner.runtime.spawn(async move {
            driver.run_driver(connectivity_changes).await;
        });

        manager.attempt_submission();
        Ok(manager)
    }
}

impl OfflineRequestManager {
    /// Start building a manager around a store and a factory for restoring
    /// stored units.
    pub fn builder(store: Arc<dyn PersistenceStore>, factory: Arc<dyn UnitFactory>) -> ManagerBuilder {
        ManagerBuilder {
            store,
            factory,
            admission: Arc::new(AllowAll),
            observer: Arc::new(NoopObserver),
            connectivity: Arc::new(ConnectivityMonitor::new(true)),
            config: ManagerConfig::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Append a unit to the tail of the queue, persist, and trigger a
    /// submission attempt.
    pub async fn enqueue<R: OfflineRequest + 'static>(&self, request: R) -> UnitId {
        self.enqueue_shared(Arc::new(request)).await
    }

    /// [`enqueue`](Self::enqueue) for a request that is already shared.
    pub async fn enqueue_shared(&self, request: Arc<dyn OfflineRequest>) -> UnitId {
        let id = UnitId::new();
        {
            let mut state = self.inner.state.lock();
            state.push(id, Entry::new(request, 0, Utc::now()));
        }

        debug!(%id, "unit queued");
        metrics::units_enqueued().add(1, &[]);
        self.inner.events.emit(EventKind::UnitQueued { id });

        self.persist().await;
        self.notify_progress();
        self.submit_eligible();
        id
    }

    /// Enqueue from a thread that is not running inside the runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context; use
    /// [`enqueue`](Self::enqueue) there.
    pub fn enqueue_blocking<R: OfflineRequest + 'static>(&self, request: R) -> UnitId {
        self.inner.runtime.block_on(self.enqueue(request))
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Try to start every eligible unit, in FIFO order.
    ///
    /// Idempotent and safe to call from any thread at any time. Units that
    /// failed earlier become eligible again.
    pub fn attempt_submission(&self) {
        self.inner.state.lock().release_holds();
        self.submit_eligible();
    }

    /// Start eligible units without releasing retry holds.
    fn submit_eligible(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if !self.inner.connectivity.current() {
            debug!("offline, deferring submission");
            return;
        }

        let candidates = self.inner.state.lock().eligible();
        for (id, request) in candidates {
            // The predicate is host code; never call it under the state lock.
            if !self.inner.admission.allows(id, request.as_ref()) {
                debug!(%id, "admission denied, unit stays pending");
                continue;
            }

            let attempt = {
                let mut state = self.inner.state.lock();
                if let Some(max) = self.inner.config.max_concurrent {
                    if state.executing_count() >= max {
                        debug!(max, "concurrency cap reached");
                        break;
                    }
                }
                let Some(entry) = state.get_mut(&id) else {
                    continue;
                };
                if entry.retry_held || entry.transition(UnitState::Executing).is_err() {
                    // Started, finished or failed elsewhere since the scan.
                    continue;
                }
                entry.attempts += 1;
                entry.progress = 0.0;
                let attempt = entry.attempts;
                state.revision += 1;
                attempt
            };

            let manager = self.clone();
            self.inner
                .runtime
                .spawn(async move { manager.run_attempt(id, request, attempt).await });
        }
    }

    async fn run_attempt(self, id: UnitId, request: Arc<dyn OfflineRequest>, attempt: u32) {
        let span = start_unit_span(&id, attempt);

        async {
            record_state_transition(&span, "pending", "executing");
            self.inner
                .events
                .emit(EventKind::UnitStarted { id, attempt });
            self.inner.observer.on_unit_started(id, request.as_ref());

            let started = Instant::now();
            let outcome = self.perform(id, Arc::clone(&request), attempt).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            metrics::attempt_duration_ms().record(
                duration_ms as f64,
                &[KeyValue::new(
                    "result",
                    if outcome.is_ok() { "ok" } else { "error" },
                )],
            );

            match outcome {
                Ok(()) => {
                    self.finish_success(id, &request, attempt, duration_ms, &span)
                        .await
                }
                Err(error) => self.finish_failure(id, &request, attempt, error, &span).await,
            }

            // Keep draining without waiting for the timer.
            self.submit_eligible();
        }
        .instrument(span.clone())
        .await
    }

    /// Run the unit's work in its own task so a panic or a time limit cannot
    /// strand it in the executing state.
    async fn perform(&self, id: UnitId, request: Arc<dyn OfflineRequest>, attempt: u32) -> Result<()> {
        let ctx = RequestContext::new(self.clone(), id, attempt);
        let mut task = tokio::spawn(async move { request.perform(ctx).await }.in_current_span());

        let joined = match self.inner.config.request_time_limit {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(Error::TimedOut { id, limit });
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(Error::UnitExecutionFailed { id, source }),
            Err(e) => Err(Error::UnitExecutionFailed {
                id,
                source: format!("attempt aborted: {e}").into(),
            }),
        }
    }

    async fn finish_success(
        &self,
        id: UnitId,
        request: &Arc<dyn OfflineRequest>,
        attempt: u32,
        duration_ms: u64,
        span: &Span,
    ) {
        let completed = {
            let mut state = self.inner.state.lock();
            let transitioned = state
                .get_mut(&id)
                .map(|entry| entry.transition(UnitState::Completed));
            match transitioned {
                Some(Ok(_)) => state.retire(&id).is_some(),
                Some(Err(e)) => {
                    error!(%id, error = %e, "completion for a unit that was not executing");
                    false
                }
                None => false,
            }
        };
        if !completed {
            return;
        }

        record_state_transition(span, "executing", "completed");
        info!(%id, attempt, duration_ms, "unit completed");
        metrics::unit_outcomes().add(1, &[KeyValue::new("result", "completed")]);

        // Persist before telling anyone, so a crash cannot resurrect it.
        self.persist().await;

        self.inner.events.emit(EventKind::UnitCompleted {
            id,
            attempt,
            duration_ms,
        });
        self.inner.observer.on_unit_completed(id, request.as_ref());
        self.notify_progress();
    }

    async fn finish_failure(
        &self,
        id: UnitId,
        request: &Arc<dyn OfflineRequest>,
        attempt: u32,
        error: Error,
        span: &Span,
    ) {
        let resubmit = request.should_attempt_resubmission(&error);
        let retry_allowed = self.inner.config.retry.allows_retry(attempt);

        let disposition = {
            let mut state = self.inner.state.lock();
            let transitioned = state
                .get_mut(&id)
                .map(|entry| entry.transition(UnitState::Failed));
            match transitioned {
                Some(Ok(_)) if resubmit && retry_allowed => {
                    if let Some(entry) = state.get_mut(&id) {
                        let _ = entry.transition(UnitState::Pending);
                        entry.progress = 0.0;
                        entry.retry_held = true;
                    }
                    state.revision += 1;
                    Some(Disposition::Requeued)
                }
                Some(Ok(_)) => {
                    if let Some(entry) = state.get_mut(&id) {
                        let _ = entry.transition(UnitState::Dropped);
                    }
                    state.retire(&id);
                    Some(Disposition::Dropped(if resubmit {
                        DropReason::RetriesExhausted
                    } else {
                        DropReason::ResubmissionDeclined
                    }))
                }
                Some(Err(e)) => {
                    error!(%id, error = %e, "failure for a unit that was not executing");
                    None
                }
                None => None,
            }
        };
        let Some(disposition) = disposition else {
            return;
        };

        let will_retry = matches!(disposition, Disposition::Requeued);
        record_state_transition(span, "executing", "failed");
        warn!(%id, attempt, error = %error, will_retry, "unit failed");
        metrics::unit_outcomes().add(
            1,
            &[KeyValue::new(
                "result",
                if will_retry { "retry" } else { "dropped" },
            )],
        );

        self.persist().await;

        self.inner.events.emit(EventKind::UnitFailed {
            id,
            attempt,
            error: error.to_string(),
            will_retry,
        });
        if let Disposition::Dropped(reason) = disposition {
            record_state_transition(span, "failed", "dropped");
            info!(%id, ?reason, "unit dropped");
            self.inner.events.emit(EventKind::UnitDropped { id, reason });
        } else {
            record_state_transition(span, "failed", "pending");
        }
        self.inner.observer.on_unit_failed(id, request.as_ref(), &error);
        self.notify_progress();
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load the stored queue and rebuild units through the factory.
    async fn restore(&self) {
        let stored = match self.inner.store.load().await {
            Ok(units) => units,
            Err(e) => {
                error!(error = %e, "failed to load persisted queue, starting empty");
                metrics::persistence_failures().add(1, &[KeyValue::new("operation", "load")]);
                self.report_persistence_error(e);
                return;
            }
        };

        // The factory is host code; rebuild everything before taking the lock.
        let mut seen = HashSet::new();
        let mut rebuilt = Vec::new();
        let mut unreconstructable = Vec::new();
        let mut duplicates = 0usize;
        for unit in stored {
            if !seen.insert(unit.id) {
                duplicates += 1;
                continue;
            }
            match self.inner.factory.from_record(&unit.record) {
                Some(request) => rebuilt.push((unit, request)),
                None => unreconstructable.push(unit.id),
            }
        }

        let mut restored = Vec::with_capacity(rebuilt.len());
        {
            let mut state = self.inner.state.lock();
            for (unit, request) in rebuilt {
                state.push(unit.id, Entry::new(request, unit.attempts, unit.enqueued_at));
                restored.push((unit.id, unit.attempts));
            }
            if duplicates == 0 && unreconstructable.is_empty() {
                // Memory matches the store exactly.
                state.saved_revision = state.revision;
            } else {
                state.revision += 1;
            }
        }

        for (id, attempts) in &restored {
            self.inner.events.emit(EventKind::UnitRestored {
                id: *id,
                attempts: *attempts,
            });
        }
        if duplicates > 0 {
            warn!(duplicates, "collapsed duplicate unit ids in persisted queue");
        }
        for id in &unreconstructable {
            let e = Error::ReconstructionFailed { id: *id };
            warn!(%id, error = %e, "dropping unreconstructable unit");
            self.inner.events.emit(EventKind::UnitDropped {
                id: *id,
                reason: DropReason::Unreconstructable,
            });
        }

        info!(
            restored = restored.len(),
            dropped = unreconstructable.len(),
            "persisted queue restored"
        );

        // Rewrite the store without the entries we could not keep.
        self.persist().await;
        self.notify_progress();
    }

    /// Write the latest queue snapshot if it has not been written yet.
    ///
    /// Saves are serialized; each one captures the newest state at the time
    /// it runs, so a burst of mutations collapses into few writes and the
    /// store never moves backwards.
    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;

        let (revision, units) = {
            let state = self.inner.state.lock();
            if state.revision <= state.saved_revision {
                return;
            }
            (state.revision, state.persistable())
        };
        let units = to_stored(units);

        match self.inner.store.save(&units).await {
            Ok(()) => {
                let mut state = self.inner.state.lock();
                state.saved_revision = state.saved_revision.max(revision);
                debug!(revision, units = units.len(), "queue persisted");
            }
            Err(e) => {
                // The in-memory queue stays authoritative; the next mutation retries the write.
                error!(error = %e, "failed to persist queue");
                metrics::persistence_failures().add(1, &[KeyValue::new("operation", "save")]);
                self.report_persistence_error(e);
            }
        }
    }

    fn report_persistence_error(&self, error: Error) {
        self.inner.events.emit(EventKind::PersistenceFailed {
            error: error.to_string(),
        });
        self.inner.observer.on_persistence_error(&error);
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    fn notify_progress(&self) {
        match self.inner.progress.admit() {
            Gate::Open => self.emit_progress(),
            Gate::Trailing(delay) => {
                let manager = self.clone();
                self.inner.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.inner.progress.trailing_fired();
                    manager.emit_progress();
                });
            }
            Gate::Coalesced => {}
        }
    }

    fn emit_progress(&self) {
        let progress = self.progress();
        self.inner.observer.on_progress(progress);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Mean progress over every known unit; finished units count as 1.0.
    pub fn progress(&self) -> f64 {
        self.inner.state.lock().progress()
    }

    pub fn completed_request_count(&self) -> u64 {
        self.inner.state.lock().completed
    }

    /// Units enqueued or restored during this process lifetime.
    pub fn total_request_count(&self) -> u64 {
        self.inner.state.lock().total
    }

    /// Units still in the queue, executing ones included.
    pub fn pending_request_count(&self) -> usize {
        self.inner.state.lock().len()
    }

    pub fn executing_count(&self) -> usize {
        self.inner.state.lock().executing_count()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connectivity.current()
    }

    /// Snapshot of the queue in FIFO order.
    pub fn units(&self) -> Vec<UnitSnapshot> {
        self.inner.state.lock().snapshots()
    }

    /// `None` once the unit has left the queue.
    pub fn unit_state(&self, id: UnitId) -> Option<UnitState> {
        self.inner.state.lock().get(&id).map(|entry| entry.state)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Subscribe to the structured event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Remove every pending unit. Executing units run to completion.
    pub async fn clear_pending(&self) -> usize {
        let drained = self.inner.state.lock().drain_pending();
        for (id, _) in &drained {
            self.inner.events.emit(EventKind::UnitDropped {
                id: *id,
                reason: DropReason::Cleared,
            });
        }
        info!(count = drained.len(), "cleared pending units");

        self.persist().await;
        self.notify_progress();
        drained.len()
    }

    /// Stop the driver and stop starting new attempts. In-flight attempts
    /// still finish and persist.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
    }
}

impl std::fmt::Debug for OfflineRequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("OfflineRequestManager")
            .field("pending", &state.len())
            .field("completed", &state.completed)
            .field("total", &state.total)
            .field("config", &self.inner.config)
            .finish()
    }
}
