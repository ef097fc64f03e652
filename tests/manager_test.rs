//! Integration tests for the offline request manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use outbox_rs::event::{DropReason, EventKind};
use outbox_rs::store::MemoryStore;
use outbox_rs::*;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tally {
    runs: AtomicUsize,
    running: AtomicBool,
    overlaps: AtomicUsize,
}

#[derive(Clone)]
enum Behavior {
    Succeed,
    FailTimes(usize),
    Hang,
    Sleep(Duration),
    Panic,
    Decline,
    Park(Arc<Notify>),
    Resave(Arc<Notify>),
}

struct TestRequest {
    tag: i64,
    behavior: Behavior,
    persist: bool,
    tally: Arc<Tally>,
}

impl TestRequest {
    fn new(tag: i64, behavior: Behavior) -> Self {
        Self {
            tag,
            behavior,
            persist: true,
            tally: Arc::new(Tally::default()),
        }
    }

    fn tallied(tag: i64, behavior: Behavior) -> (Self, Arc<Tally>) {
        let request = Self::new(tag, behavior);
        let tally = Arc::clone(&request.tally);
        (request, tally)
    }
}

#[async_trait]
impl OfflineRequest for TestRequest {
    fn to_record(&self) -> Option<Record> {
        if !self.persist {
            return None;
        }
        let mut record = Record::new();
        record.insert("kind".into(), "test".into());
        record.insert("tag".into(), self.tag.into());
        Some(record)
    }

    async fn perform(&self, ctx: RequestContext) -> std::result::Result<(), RequestError> {
        let run = self.tally.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tally.running.swap(true, Ordering::SeqCst) {
            self.tally.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::FailTimes(n) if run <= *n => Err(format!("run {run} failed").into()),
            Behavior::FailTimes(_) => Ok(()),
            Behavior::Hang => std::future::pending().await,
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            Behavior::Panic => panic!("unit {} blew up", self.tag),
            Behavior::Decline => Err("permanent failure".into()),
            Behavior::Park(release) => {
                ctx.report_progress(0.5);
                release.notified().await;
                Ok(())
            }
            Behavior::Resave(release) => {
                ctx.save().await;
                release.notified().await;
                Ok(())
            }
        };

        self.tally.running.store(false, Ordering::SeqCst);
        result
    }

    fn should_attempt_resubmission(&self, _error: &Error) -> bool {
        !matches!(self.behavior, Behavior::Decline)
    }
}

fn rebuild(record: &Record) -> Option<Arc<dyn OfflineRequest>> {
    if record.get("kind")?.as_str()? != "test" {
        return None;
    }
    let tag = record.get("tag")?.as_i64()?;
    Some(Arc::new(TestRequest::new(tag, Behavior::Succeed)))
}

#[derive(Default)]
struct RecordingObserver {
    started: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    persistence_errors: AtomicUsize,
    connectivity: Mutex<Vec<bool>>,
    progress: Mutex<Vec<f64>>,
}

impl QueueObserver for RecordingObserver {
    fn on_progress(&self, progress: f64) {
        self.progress.lock().push(progress);
    }

    fn on_connectivity_change(&self, connected: bool) {
        self.connectivity.lock().push(connected);
    }

    fn on_unit_started(&self, _id: UnitId, _request: &dyn OfflineRequest) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_unit_completed(&self, _id: UnitId, _request: &dyn OfflineRequest) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_unit_failed(&self, _id: UnitId, _request: &dyn OfflineRequest, _error: &Error) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_persistence_error(&self, _error: &Error) {
        self.persistence_errors.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        submission_interval: Duration::from_millis(50),
        progress_interval: Duration::from_millis(10),
        ..ManagerConfig::default()
    }
}

fn builder(store: Arc<MemoryStore>) -> ManagerBuilder {
    OfflineRequestManager::builder(store, Arc::new(rebuild)).config(fast_config())
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Producers and execution
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enqueue_from_tasks_and_threads_counts_every_unit() {
    let store = Arc::new(MemoryStore::new());
    let admission = AdmissionSwitch::new(false);
    let observer = Arc::new(RecordingObserver::default());
    let manager = builder(Arc::clone(&store))
        .admission(Arc::new(admission.clone()))
        .observer(observer.clone())
        .start()
        .await
        .unwrap();

    let from_task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                manager.enqueue(TestRequest::new(i, Behavior::Succeed)).await;
            }
        })
    };
    let from_thread = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            for i in 50..100 {
                manager.enqueue_blocking(TestRequest::new(i, Behavior::Succeed));
            }
        })
    };

    from_task.await.unwrap();
    tokio::task::spawn_blocking(move || from_thread.join().unwrap())
        .await
        .unwrap();

    assert_eq!(manager.total_request_count(), 100);
    assert_eq!(manager.pending_request_count(), 100);
    assert_eq!(store.snapshot().len(), 100);

    admission.set(true);
    manager.attempt_submission();
    wait_until("queue to drain", || manager.completed_request_count() == 100).await;

    assert_eq!(manager.pending_request_count(), 0);
    assert_eq!(observer.completed.load(Ordering::SeqCst), 100);
    assert_eq!(manager.progress(), 1.0);
    wait_until("empty snapshot", || store.snapshot().is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_never_run_a_unit_twice() {
    let store = Arc::new(MemoryStore::new());
    let admission = AdmissionSwitch::new(false);
    let manager = builder(store)
        .admission(Arc::new(admission.clone()))
        .config(ManagerConfig {
            max_concurrent: None,
            ..fast_config()
        })
        .start()
        .await
        .unwrap();

    let mut tallies = Vec::new();
    for i in 0..30 {
        let (request, tally) = TestRequest::tallied(i, Behavior::Succeed);
        manager.enqueue(request).await;
        tallies.push(tally);
    }

    admission.set(true);
    let triggers: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    manager.attempt_submission();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for trigger in triggers {
        trigger.await.unwrap();
    }

    wait_until("all units", || manager.completed_request_count() == 30).await;
    for tally in &tallies {
        assert_eq!(tally.runs.load(Ordering::SeqCst), 1);
        assert_eq!(tally.overlaps.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrency_cap_limits_executing_units() {
    let release = Arc::new(Notify::new());
    let manager = builder(Arc::new(MemoryStore::new()))
        .config(ManagerConfig {
            max_concurrent: Some(2),
            ..fast_config()
        })
        .start()
        .await
        .unwrap();

    for i in 0..5 {
        manager
            .enqueue(TestRequest::new(i, Behavior::Park(Arc::clone(&release))))
            .await;
    }

    wait_until("two running", || manager.executing_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.executing_count(), 2);

    for _ in 0..5 {
        release.notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    wait_until("all complete", || manager.completed_request_count() == 5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_unit_stays_queued_and_succeeds_later() {
    let observer = Arc::new(RecordingObserver::default());
    let manager = builder(Arc::new(MemoryStore::new()))
        .observer(observer.clone())
        .start()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let (request, tally) = TestRequest::tallied(1, Behavior::FailTimes(1));
    let id = manager.enqueue(request).await;

    wait_until("retry to succeed", || manager.completed_request_count() == 1).await;
    assert_eq!(tally.runs.load(Ordering::SeqCst), 2);
    assert_eq!(observer.failed.load(Ordering::SeqCst), 1);
    assert_eq!(manager.unit_state(id), None);

    let mut saw_retry = false;
    while let Ok(event) = events.try_recv() {
        if let EventKind::UnitFailed { will_retry, attempt, .. } = event.kind {
            assert!(will_retry);
            assert_eq!(attempt, 1);
            saw_retry = true;
        }
    }
    assert!(saw_retry);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_unit_does_not_starve_the_rest() {
    let manager = builder(Arc::new(MemoryStore::new()))
        .config(ManagerConfig {
            submission_interval: Duration::from_secs(60),
            ..fast_config()
        })
        .start()
        .await
        .unwrap();

    let failing = manager
        .enqueue(TestRequest::new(0, Behavior::FailTimes(usize::MAX)))
        .await;
    for i in 1..4 {
        manager.enqueue(TestRequest::new(i, Behavior::Succeed)).await;
    }

    wait_until("healthy units", || manager.completed_request_count() == 3).await;
    wait_until("failed unit back in queue", || {
        manager.unit_state(failing) == Some(UnitState::Pending)
    })
    .await;
    assert_eq!(manager.pending_request_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_ceiling_drops_the_unit() {
    let manager = builder(Arc::new(MemoryStore::new()))
        .config(ManagerConfig {
            retry: RetryPolicy::limited(3),
            ..fast_config()
        })
        .start()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let (request, tally) = TestRequest::tallied(7, Behavior::FailTimes(usize::MAX));
    let id = manager.enqueue(request).await;

    wait_until("unit dropped", || manager.pending_request_count() == 0).await;
    assert_eq!(tally.runs.load(Ordering::SeqCst), 3);
    assert_eq!(manager.completed_request_count(), 0);
    assert_eq!(manager.progress(), 1.0);

    let mut reason = None;
    while let Ok(event) = events.try_recv() {
        if let EventKind::UnitDropped { id: dropped, reason: r } = event.kind {
            assert_eq!(dropped, id);
            reason = Some(r);
        }
    }
    assert_eq!(reason, Some(DropReason::RetriesExhausted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declined_resubmission_drops_after_one_attempt() {
    let manager = builder(Arc::new(MemoryStore::new())).start().await.unwrap();
    let mut events = manager.subscribe();

    let (request, tally) = TestRequest::tallied(3, Behavior::Decline);
    manager.enqueue(request).await;

    wait_until("unit dropped", || manager.pending_request_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(tally.runs.load(Ordering::SeqCst), 1);

    let dropped: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event.kind {
            EventKind::UnitDropped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![DropReason::ResubmissionDeclined]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_attempt_is_cut_off_by_the_time_limit() {
    let manager = builder(Arc::new(MemoryStore::new()))
        .config(ManagerConfig {
            request_time_limit: Some(Duration::from_millis(50)),
            retry: RetryPolicy::limited(1),
            ..fast_config()
        })
        .start()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    manager.enqueue(TestRequest::new(1, Behavior::Hang)).await;
    wait_until("timeout", || manager.pending_request_count() == 0).await;

    let error = std::iter::from_fn(|| events.try_recv().ok())
        .find_map(|event| match event.kind {
            EventKind::UnitFailed { error, .. } => Some(error),
            _ => None,
        })
        .unwrap();
    assert!(error.contains("time limit"), "unexpected error: {error}");
    assert_eq!(manager.executing_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn long_unit_runs_to_completion_with_default_config() {
    let observer = Arc::new(RecordingObserver::default());
    let manager = OfflineRequestManager::builder(Arc::new(MemoryStore::new()), Arc::new(rebuild))
        .observer(observer.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(manager.config().request_time_limit, None);

    let (request, tally) = TestRequest::tallied(1, Behavior::Sleep(Duration::from_secs(130)));
    manager.enqueue(request).await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(manager.completed_request_count(), 1);
    assert_eq!(tally.runs.load(Ordering::SeqCst), 1);
    assert_eq!(observer.failed.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_unit_fails_without_wedging_the_queue() {
    let observer = Arc::new(RecordingObserver::default());
    let manager = builder(Arc::new(MemoryStore::new()))
        .observer(observer.clone())
        .config(ManagerConfig {
            retry: RetryPolicy::limited(1),
            ..fast_config()
        })
        .start()
        .await
        .unwrap();

    manager.enqueue(TestRequest::new(1, Behavior::Panic)).await;
    wait_until("panic handled", || observer.failed.load(Ordering::SeqCst) == 1).await;

    manager.enqueue(TestRequest::new(2, Behavior::Succeed)).await;
    wait_until("next unit", || manager.completed_request_count() == 1).await;
    assert_eq!(manager.pending_request_count(), 0);
}

// ---------------------------------------------------------------------------
// Admission and connectivity
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admission_predicate_holds_units_pending() {
    let admission = AdmissionSwitch::new(false);
    let manager = builder(Arc::new(MemoryStore::new()))
        .admission(Arc::new(admission.clone()))
        .start()
        .await
        .unwrap();

    let (request, tally) = TestRequest::tallied(1, Behavior::Succeed);
    let id = manager.enqueue(request).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(tally.runs.load(Ordering::SeqCst), 0);
    assert_eq!(manager.unit_state(id), Some(UnitState::Pending));

    admission.set(true);
    manager.attempt_submission();
    wait_until("admitted unit", || manager.completed_request_count() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closure_predicate_sees_each_unit() {
    let asked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&asked);
    let manager = builder(Arc::new(MemoryStore::new()))
        .admission(Arc::new(move |_id: UnitId, request: &dyn OfflineRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            request.to_record().is_some()
        }))
        .start()
        .await
        .unwrap();

    let mut memory_only = TestRequest::new(1, Behavior::Succeed);
    memory_only.persist = false;
    let held = manager.enqueue(memory_only).await;
    manager.enqueue(TestRequest::new(2, Behavior::Succeed)).await;

    wait_until("persistable unit", || manager.completed_request_count() == 1).await;
    assert_eq!(manager.unit_state(held), Some(UnitState::Pending));
    assert!(asked.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_queue_submits_when_connectivity_returns() {
    let connectivity = Arc::new(ConnectivityMonitor::new(false));
    let observer = Arc::new(RecordingObserver::default());
    let manager = builder(Arc::new(MemoryStore::new()))
        .connectivity(connectivity.clone())
        .observer(observer.clone())
        .config(ManagerConfig {
            submission_interval: Duration::from_secs(60),
            ..fast_config()
        })
        .start()
        .await
        .unwrap();

    let (request, tally) = TestRequest::tallied(1, Behavior::Succeed);
    manager.enqueue(request).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(tally.runs.load(Ordering::SeqCst), 0);
    assert!(!manager.is_connected());

    connectivity.set_connected(true);
    wait_until("reconnect submission", || manager.completed_request_count() == 1).await;
    assert_eq!(*observer.connectivity.lock(), vec![true]);
}

#[tokio::test]
async fn connectivity_change_right_after_start_is_observed() {
    let connectivity = Arc::new(ConnectivityMonitor::new(true));
    let observer = Arc::new(RecordingObserver::default());
    let manager = builder(Arc::new(MemoryStore::new()))
        .connectivity(connectivity.clone())
        .observer(observer.clone())
        .start()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    // The driver task has not been polled yet on this runtime.
    connectivity.set_connected(false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*observer.connectivity.lock(), vec![false]);
    let changes: Vec<bool> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event.kind {
            EventKind::ConnectivityChanged { connected } => Some(connected),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![false]);
    assert!(!manager.is_connected());
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_averages_over_all_units() {
    let release = Arc::new(Notify::new());
    let observer = Arc::new(RecordingObserver::default());
    let manager = builder(Arc::new(MemoryStore::new()))
        .observer(observer.clone())
        .config(ManagerConfig {
            max_concurrent: Some(1),
            ..fast_config()
        })
        .start()
        .await
        .unwrap();
    assert_eq!(manager.progress(), 1.0);

    manager
        .enqueue(TestRequest::new(1, Behavior::Park(Arc::clone(&release))))
        .await;
    manager.enqueue(TestRequest::new(2, Behavior::Succeed)).await;

    wait_until("half of the first unit", || {
        (manager.progress() - 0.25).abs() < 1e-9
    })
    .await;

    release.notify_one();
    wait_until("both done", || manager.completed_request_count() == 2).await;
    assert_eq!(manager.progress(), 1.0);

    wait_until("final notification", || {
        observer.progress.lock().last() == Some(&1.0)
    })
    .await;
    let seen = observer.progress.lock().clone();
    assert!(seen.iter().all(|p| (0.0..=1.0).contains(p)));
}

// ---------------------------------------------------------------------------
// Persistence and restart
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_restores_pending_units_in_order() {
    let store = Arc::new(MemoryStore::new());
    let first = builder(Arc::clone(&store))
        .admission(Arc::new(AdmissionSwitch::new(false)))
        .start()
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(first.enqueue(TestRequest::new(i, Behavior::Succeed)).await);
    }
    first.shutdown();

    let mut stored = store.snapshot();
    assert_eq!(stored.len(), 3);

    let mut garbage = stored[0].clone();
    garbage.id = UnitId::new();
    garbage.record.insert("kind".into(), "unknown".into());
    stored.insert(1, garbage);
    let duplicate = stored[0].clone();
    stored.push(duplicate);

    let reopened = Arc::new(MemoryStore::with_units(stored));
    let second = builder(Arc::clone(&reopened))
        .admission(Arc::new(AdmissionSwitch::new(false)))
        .start()
        .await
        .unwrap();

    let restored: Vec<UnitId> = second.units().iter().map(|u| u.id).collect();
    assert_eq!(restored, ids);
    assert_eq!(second.total_request_count(), 3);
    assert!(second.units().iter().all(|u| u.state == UnitState::Pending));

    let rewritten: Vec<UnitId> = reopened.snapshot().iter().map(|u| u.id).collect();
    assert_eq!(rewritten, ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_units_leave_the_store() {
    let store = Arc::new(MemoryStore::new());
    let manager = builder(Arc::clone(&store)).start().await.unwrap();

    manager.enqueue(TestRequest::new(1, Behavior::Succeed)).await;
    wait_until("completion", || manager.completed_request_count() == 1).await;
    wait_until("store cleared", || store.snapshot().is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_unit_can_persist_itself_again() {
    let store = Arc::new(MemoryStore::new());
    let release = Arc::new(Notify::new());
    let manager = builder(Arc::clone(&store)).start().await.unwrap();

    let id = manager
        .enqueue(TestRequest::new(1, Behavior::Resave(Arc::clone(&release))))
        .await;

    // One save for the enqueue, one from the unit itself.
    wait_until("re-save", || store.save_count() >= 2).await;
    assert_eq!(manager.unit_state(id), Some(UnitState::Executing));
    assert_eq!(store.snapshot()[0].attempts, 1);

    release.notify_one();
    wait_until("completion", || manager.completed_request_count() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_only_units_are_never_written() {
    let store = Arc::new(MemoryStore::new());
    let manager = builder(Arc::clone(&store))
        .admission(Arc::new(AdmissionSwitch::new(false)))
        .start()
        .await
        .unwrap();

    let mut request = TestRequest::new(1, Behavior::Succeed);
    request.persist = false;
    manager.enqueue(request).await;
    let kept = manager.enqueue(TestRequest::new(2, Behavior::Succeed)).await;

    assert_eq!(manager.pending_request_count(), 2);
    let stored: Vec<UnitId> = store.snapshot().iter().map(|u| u.id).collect();
    assert_eq!(stored, vec![kept]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn save_failures_are_reported_and_memory_stays_authoritative() {
    let store = Arc::new(MemoryStore::new());
    store.set_fail_saves(true);
    let observer = Arc::new(RecordingObserver::default());
    let manager = builder(Arc::clone(&store))
        .observer(observer.clone())
        .start()
        .await
        .unwrap();
    let mut events = manager.subscribe();

    manager.enqueue(TestRequest::new(1, Behavior::Succeed)).await;
    wait_until("completion", || manager.completed_request_count() == 1).await;

    assert!(observer.persistence_errors.load(Ordering::SeqCst) >= 1);
    assert!(
        std::iter::from_fn(|| events.try_recv().ok())
            .any(|event| matches!(event.kind, EventKind::PersistenceFailed { .. }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreadable_store_starts_empty() {
    let store = Arc::new(MemoryStore::new());
    store.set_fail_loads(true);
    let observer = Arc::new(RecordingObserver::default());

    let manager = builder(store)
        .observer(observer.clone())
        .start()
        .await
        .unwrap();

    assert_eq!(manager.pending_request_count(), 0);
    assert_eq!(observer.persistence_errors.load(Ordering::SeqCst), 1);

    manager.enqueue(TestRequest::new(1, Behavior::Succeed)).await;
    wait_until("completion", || manager.completed_request_count() == 1).await;
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_pending_empties_queue_and_store() {
    let store = Arc::new(MemoryStore::new());
    let manager = builder(Arc::clone(&store))
        .admission(Arc::new(AdmissionSwitch::new(false)))
        .start()
        .await
        .unwrap();

    for i in 0..3 {
        manager.enqueue(TestRequest::new(i, Behavior::Succeed)).await;
    }
    assert_eq!(manager.clear_pending().await, 3);
    assert_eq!(manager.pending_request_count(), 0);
    assert!(store.snapshot().is_empty());
    assert_eq!(manager.progress(), 1.0);
    assert_eq!(manager.total_request_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_new_submissions() {
    let manager = builder(Arc::new(MemoryStore::new())).start().await.unwrap();
    manager.shutdown();

    let (request, tally) = TestRequest::tallied(1, Behavior::Succeed);
    manager.enqueue(request).await;
    manager.attempt_submission();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(tally.runs.load(Ordering::SeqCst), 0);
    assert_eq!(manager.pending_request_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_follow_the_unit_lifecycle() {
    let manager = builder(Arc::new(MemoryStore::new())).start().await.unwrap();
    let mut events = manager.subscribe();

    let id = manager.enqueue(TestRequest::new(1, Behavior::Succeed)).await;
    wait_until("completion", || manager.completed_request_count() == 1).await;

    let kinds: Vec<EventKind> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| event.kind)
        .collect();
    assert!(matches!(kinds[0], EventKind::UnitQueued { id: q } if q == id));
    assert!(matches!(kinds[1], EventKind::UnitStarted { id: s, attempt: 1 } if s == id));
    assert!(matches!(kinds[2], EventKind::UnitCompleted { id: c, attempt: 1, .. } if c == id));
}

#[tokio::test]
async fn zero_submission_interval_is_rejected() {
    let result = builder(Arc::new(MemoryStore::new()))
        .config(ManagerConfig {
            submission_interval: Duration::ZERO,
            ..ManagerConfig::default()
        })
        .start()
        .await;
    assert!(matches!(result, Err(Error::Config(_))));
}
