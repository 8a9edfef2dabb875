use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::store::mutation;
use crate::engine::{now_ms, BookingStore, EngineError, WalStore};
use crate::model::*;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// A `Pending` booking older than this is flagged.
    pub stale_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub candidates: usize,
    pub marked: usize,
    /// Already flagged, no longer stale, deleted, or lost to a concurrent update.
    pub skipped: usize,
    pub failed: usize,
}

/// Flags `Pending` bookings nobody has picked up. It only appends a
/// `timeout-check` entry; it never cancels or reassigns.
pub struct Reconciler {
    store: Arc<dyn BookingStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn BookingStore>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    fn cutoff(&self, now: Ms) -> Ms {
        let stale_after = Ms::try_from(self.config.stale_after.as_millis()).unwrap_or(Ms::MAX);
        now.saturating_sub(stale_after)
    }

    /// Run one pass as of `now`. Only a failed scan is an error; per-record
    /// failures are counted and the pass carries on.
    pub async fn tick(&self, now: Ms) -> Result<TickReport, EngineError> {
        let cutoff = self.cutoff(now);
        let candidates = self
            .store
            .find(&move |b: &Booking| b.status == Status::Pending && b.created_at < cutoff)
            .await?;

        let mut report = TickReport {
            candidates: candidates.len(),
            ..TickReport::default()
        };
        for candidate in candidates {
            let marked = Arc::new(AtomicBool::new(false));
            let flag = marked.clone();
            // Re-checked under the record lock: the booking may have been
            // accepted or flagged since the scan.
            let result = self
                .store
                .update(
                    candidate.id,
                    mutation(move |b: &Booking| {
                        let still_stale = b.status == Status::Pending && b.created_at < cutoff;
                        let already_flagged = b
                            .last_entry()
                            .is_some_and(|e| e.action == Action::TimeoutCheck);
                        if !still_stale || already_flagged {
                            return Ok(None);
                        }
                        flag.store(true, Ordering::Relaxed);
                        Ok(Some(Change {
                            status: b.status,
                            provider: b.provider,
                            entry: HistoryEntry::new(Action::TimeoutCheck, ActorRef::system(), now),
                        }))
                    }),
                )
                .await;

            match result {
                Ok(_) if marked.load(Ordering::Relaxed) => {
                    report.marked += 1;
                    metrics::counter!(crate::observability::STALE_MARKED_TOTAL).increment(1);
                    info!(booking = %candidate.id, age_ms = now - candidate.created_at, "flagged stale pending booking");
                }
                Ok(_) => report.skipped += 1,
                Err(e @ (EngineError::NotFound(_) | EngineError::Conflict(_))) => {
                    debug!(booking = %candidate.id, "reconcile skip: {e}");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(booking = %candidate.id, error = e.kind(), "reconcile failed: {e}");
                    metrics::counter!(crate::observability::RECONCILE_FAILURES_TOTAL).increment(1);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Spawn the periodic loop. Ticks run one at a time; a tick that overruns
    /// the period makes the loop skip the missed firings.
    pub fn start(self) -> SchedulerHandle {
        SchedulerHandle::spawn(move |cancel| self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let started = Instant::now();
            match self.tick(now_ms()).await {
                Ok(report) if report.marked > 0 || report.failed > 0 => {
                    info!(
                        candidates = report.candidates,
                        marked = report.marked,
                        failed = report.failed,
                        "reconcile tick"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("reconcile scan failed, retrying next tick: {e}"),
            }
            metrics::histogram!(crate::observability::RECONCILE_TICK_DURATION_SECONDS)
                .record(started.elapsed().as_secs_f64());
        }
        debug!("reconciler stopped");
    }
}

/// Owner of a spawned background loop.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn spawn<F>(f: impl FnOnce(CancellationToken) -> F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(f(cancel.clone()));
        Self { cancel, task }
    }

    /// Signal the loop and wait for an in-flight pass to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("background task ended abnormally: {e}");
        }
    }
}

/// Rewrite the WAL once enough appends have piled up since the last compaction.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!(appends, live = store.len(), "compacted WAL"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use ulid::Ulid;

    use super::*;
    use crate::engine::store::{Mutation, Precondition, Predicate};
    use crate::engine::Engine;

    const MIN: Ms = 60_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("servicesync_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn details() -> BookingDetails {
        BookingDetails {
            service_type: "Pest control".into(),
            date: "2026-11-15".into(),
            location: None,
        }
    }

    fn setup(name: &str) -> (Arc<dyn BookingStore>, Engine, Reconciler) {
        let store: Arc<dyn BookingStore> = Arc::new(WalStore::open(test_wal_path(name)).unwrap());
        let engine = Engine::new(store.clone());
        let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());
        (store, engine, reconciler)
    }

    fn timeout_checks(b: &Booking) -> usize {
        b.history
            .iter()
            .filter(|e| e.action == Action::TimeoutCheck)
            .count()
    }

    #[tokio::test]
    async fn marks_once_per_staleness_episode() {
        let (store, engine, reconciler) = setup("mark_once.wal");
        let c = Actor::customer(Ulid::new());
        let b = engine.create_booking(&c, None, details()).await.unwrap();
        let t = b.created_at;

        let early = reconciler.tick(t + 4 * MIN).await.unwrap();
        assert_eq!(early.candidates, 0);

        let first = reconciler.tick(t + 6 * MIN).await.unwrap();
        assert_eq!(first.marked, 1);
        let after = store.get(b.id).await.unwrap();
        assert_eq!(timeout_checks(&after), 1);
        let mark = after.last_entry().unwrap();
        assert_eq!(mark.actor, ActorRef::system());
        assert_eq!(mark.at, t + 6 * MIN);
        assert_eq!(after.status, Status::Pending);
        assert_eq!(after.provider, None);

        let second = reconciler.tick(t + 7 * MIN).await.unwrap();
        assert_eq!(second.candidates, 1);
        assert_eq!(second.marked, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(timeout_checks(&store.get(b.id).await.unwrap()), 1);
    }

    #[tokio::test]
    async fn new_episode_after_rejection_is_marked_again() {
        let (store, engine, reconciler) = setup("new_episode.wal");
        let c = Actor::customer(Ulid::new());
        let p = Actor::provider(Ulid::new());
        let b = engine.create_booking(&c, None, details()).await.unwrap();
        let t = b.created_at;

        reconciler.tick(t + 6 * MIN).await.unwrap();
        engine.assign(b.id, &p, None).await.unwrap();
        let while_assigned = reconciler.tick(t + 7 * MIN).await.unwrap();
        assert_eq!(while_assigned.candidates, 0);

        engine
            .transition(b.id, TransitionRequest::new(p, Status::Pending))
            .await
            .unwrap();
        let report = reconciler.tick(t + 8 * MIN).await.unwrap();
        assert_eq!(report.marked, 1);
        assert_eq!(timeout_checks(&store.get(b.id).await.unwrap()), 2);
    }

    #[tokio::test]
    async fn ignores_fresh_and_non_pending_bookings() {
        let (_store, engine, reconciler) = setup("ignore_fresh.wal");
        let c = Actor::customer(Ulid::new());
        let p = Actor::provider(Ulid::new());
        let assigned = engine.create_booking(&c, None, details()).await.unwrap();
        engine.assign(assigned.id, &p, None).await.unwrap();
        let cancelled = engine.create_booking(&c, None, details()).await.unwrap();
        engine
            .transition(cancelled.id, TransitionRequest::new(c, Status::Cancelled))
            .await
            .unwrap();

        let report = reconciler.tick(assigned.created_at + 60 * MIN).await.unwrap();
        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn oversized_threshold_flags_nothing() {
        let store: Arc<dyn BookingStore> =
            Arc::new(WalStore::open(test_wal_path("huge_threshold.wal")).unwrap());
        let engine = Engine::new(store.clone());
        let config = ReconcilerConfig {
            stale_after: Duration::from_secs(u64::MAX),
            ..ReconcilerConfig::default()
        };
        let reconciler = Reconciler::new(store, config);
        let c = Actor::customer(Ulid::new());
        let b = engine.create_booking(&c, None, details()).await.unwrap();

        assert_eq!(reconciler.cutoff(b.created_at), b.created_at.saturating_sub(Ms::MAX));
        let report = reconciler.tick(b.created_at + 60 * MIN).await.unwrap();
        assert_eq!(report, TickReport::default());
        let report = reconciler.tick(Ms::MIN).await.unwrap();
        assert_eq!(report, TickReport::default());
    }

    /// Fails updates for one booking, delegates everything else.
    struct FlakyStore {
        inner: WalStore,
        broken: Ulid,
    }

    #[async_trait]
    impl BookingStore for FlakyStore {
        async fn create(&self, booking: Booking) -> Result<Ulid, EngineError> {
            self.inner.create(booking).await
        }

        async fn get(&self, id: Ulid) -> Result<Booking, EngineError> {
            self.inner.get(id).await
        }

        async fn find(&self, predicate: &Predicate) -> Result<Vec<Booking>, EngineError> {
            self.inner.find(predicate).await
        }

        async fn update(&self, id: Ulid, mutation: Mutation) -> Result<Booking, EngineError> {
            if id == self.broken {
                return Err(EngineError::StoreUnavailable("disk on fire".into()));
            }
            self.inner.update(id, mutation).await
        }

        async fn delete(&self, id: Ulid, precondition: Precondition) -> Result<(), EngineError> {
            self.inner.delete(id, precondition).await
        }
    }

    #[tokio::test]
    async fn one_failing_record_does_not_abort_the_tick() {
        let inner = WalStore::open(test_wal_path("flaky.wal")).unwrap();
        let c = Actor::customer(Ulid::new());
        let bookings: Vec<Booking> = (0..3)
            .map(|i| Booking::new(Ulid::new(), &c, details(), 1_000 + i))
            .collect();
        for b in &bookings {
            inner.create(b.clone()).await.unwrap();
        }
        let store = Arc::new(FlakyStore {
            inner,
            broken: bookings[1].id,
        });
        let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());

        let report = reconciler.tick(1_000 + 10 * MIN).await.unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.marked, 2);
        assert_eq!(report.failed, 1);

        for (i, b) in bookings.iter().enumerate() {
            let stored = store.get(b.id).await.unwrap();
            assert_eq!(timeout_checks(&stored), usize::from(i != 1));
        }

        // The broken record is retried on the next pass; the others stay put.
        let next = reconciler.tick(1_000 + 11 * MIN).await.unwrap();
        assert_eq!(next.marked, 0);
        assert_eq!(next.skipped, 2);
        assert_eq!(next.failed, 1);
    }

    #[tokio::test]
    async fn started_loop_marks_and_stops() {
        let store: Arc<dyn BookingStore> =
            Arc::new(WalStore::open(test_wal_path("loop.wal")).unwrap());
        let c = Actor::customer(Ulid::new());
        // Created long ago so the first tick flags it.
        let old = Booking::new(Ulid::new(), &c, details(), now_ms() - 10 * MIN);
        store.create(old.clone()).await.unwrap();

        let handle = Reconciler::new(
            store.clone(),
            ReconcilerConfig {
                interval: Duration::from_millis(20),
                stale_after: Duration::from_secs(300),
            },
        )
        .start();

        let mut flagged = false;
        for _ in 0..100 {
            if timeout_checks(&store.get(old.id).await.unwrap()) > 0 {
                flagged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;
        assert!(flagged, "background loop never flagged the stale booking");

        // Stopped: nothing else touches it.
        let snapshot = store.get(old.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get(old.id).await.unwrap(), snapshot);
        assert_eq!(timeout_checks(&snapshot), 1);
    }

    #[tokio::test]
    async fn compactor_rewrites_after_threshold() {
        let store = Arc::new(WalStore::open(test_wal_path("compactor.wal")).unwrap());
        let c = Actor::customer(Ulid::new());
        for _ in 0..5 {
            store
                .create(Booking::new(Ulid::new(), &c, details(), 1))
                .await
                .unwrap();
        }
        assert_eq!(store.appends_since_compact().await, 5);

        let compactor = {
            let store = store.clone();
            SchedulerHandle::spawn(move |cancel| run_compactor(store, 3, cancel))
        };
        let mut compacted = false;
        for _ in 0..100 {
            if store.appends_since_compact().await == 0 {
                compacted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        compactor.stop().await;
        assert!(compacted);
        assert_eq!(store.len(), 5);
    }
}
