#[cfg(test)]
mod protocol_tests {
    use crate::config::{BackendKind, CoordinatorConfig};
    use crate::coordination::{
        case_lock_key, job_lock_key, Accounted, CounterDelta, DisabledLockManager, FailedJob,
        LockManager, MemoryLockManager, MemoryRunStateStore, RunCounters, RunMeta,
        RunStateStore, SqliteCoordination,
    };
    use crate::database::{Database, TranscriptResult};
    use crate::error::{AppError, AppResult};
    use crate::notify::tests::{FailingNotifier, RecordingNotifier};
    use crate::notify::{CompletionBus, Notifier, EVENT_CASE_PROGRESS, EVENT_CASE_TRANSCRIBED};
    use crate::provider::{ProviderError, TranscriptionProvider};
    use crate::worker::dispatch::{CompletionMode, DispatchOutcome};
    use crate::worker::events::{CaseTranscribed, JobFinished, JobOutcome};
    use crate::worker::finalize::{finalize_task, FinalizeStep, Finalizer};
    use crate::{Coordinator, CoordinatorParts};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Semaphore};
    use tokio_util::sync::CancellationToken;

    const LONG: Duration = Duration::from_secs(30);

    // =========================================================================
    // Fixtures
    // =========================================================================

    /// Provider whose behaviour is driven by the recording URL: `fail` fails,
    /// `panic` panics, anything else succeeds.
    #[derive(Default)]
    struct ScriptedProvider {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
        delay: Duration,
        missing_credentials: bool,
    }

    impl ScriptedProvider {
        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TranscriptionProvider for ScriptedProvider {
        fn check_ready(&self) -> Result<(), ProviderError> {
            if self.missing_credentials {
                return Err(ProviderError::MissingCredentials("no key".to_string()));
            }
            Ok(())
        }

        async fn transcribe(&self, recording_ref: &str) -> Result<TranscriptResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if recording_ref.contains("panic") {
                panic!("scripted panic for {}", recording_ref);
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if recording_ref.contains("fail") {
                return Err(ProviderError::Request("scripted failure".to_string()));
            }
            Ok(TranscriptResult {
                text: format!("transcript of {}", recording_ref),
                language: Some("en".to_string()),
                ..Default::default()
            })
        }
    }

    struct Harness {
        coordinator: Arc<Coordinator>,
        db: Arc<Database>,
        locks: Arc<dyn LockManager>,
        store: Option<Arc<dyn RunStateStore>>,
        provider: Arc<ScriptedProvider>,
        _temp_dir: TempDir,
    }

    fn test_config(temp_dir: &TempDir, backend: BackendKind) -> CoordinatorConfig {
        CoordinatorConfig {
            database_path: temp_dir.path().join("cases.db"),
            backend,
            run_timeout_ms: 10_000,
            wait_timeout_ms: Some(5_000),
            job_lock_ttl_ms: 10_000,
            poll_interval_ms: 20,
            progress_every: 1,
            sweep_interval_ms: 60_000,
            max_concurrency: 4,
            per_case_concurrency: 2,
            ..Default::default()
        }
    }

    fn start_harness(
        config: CoordinatorConfig,
        temp_dir: TempDir,
        provider: ScriptedProvider,
        notifier: Arc<dyn Notifier>,
    ) -> Harness {
        let db = Arc::new(Database::new(&config.database_path).unwrap());
        let (locks, store): (Arc<dyn LockManager>, Option<Arc<dyn RunStateStore>>) =
            match config.backend {
                BackendKind::None => {
                    let locks: Arc<dyn LockManager> = Arc::new(DisabledLockManager);
                    (locks, None)
                }
                _ => {
                    let locks: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
                    let store: Arc<dyn RunStateStore> =
                        Arc::new(MemoryRunStateStore::new(config.case_lock_ttl()));
                    (locks, Some(store))
                }
            };
        let provider = Arc::new(provider);
        let coordinator = Coordinator::start(
            &config,
            CoordinatorParts {
                db: db.clone(),
                locks: locks.clone(),
                store: store.clone(),
                provider: provider.clone(),
                notifier,
            },
        );
        Harness {
            coordinator: Arc::new(coordinator),
            db,
            locks,
            store,
            provider,
            _temp_dir: temp_dir,
        }
    }

    fn memory_harness(provider: ScriptedProvider, notifier: Arc<dyn Notifier>) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, BackendKind::Memory);
        start_harness(config, temp_dir, provider, notifier)
    }

    /// One coordinator on the SQLite backend. Replicas built from the same
    /// config share the case database and the coordination file.
    struct Replica {
        coordinator: Coordinator,
        db: Arc<Database>,
        provider: Arc<ScriptedProvider>,
    }

    fn sqlite_replica(config: &CoordinatorConfig, provider: ScriptedProvider) -> Replica {
        let db = Arc::new(Database::new(&config.database_path).unwrap());
        let shared = Arc::new(
            SqliteCoordination::open(
                &config.coordination_path(),
                config.case_lock_ttl(),
                config.store_timeout(),
            )
            .unwrap(),
        );
        let locks: Arc<dyn LockManager> = shared.clone();
        let store: Arc<dyn RunStateStore> = shared;
        let provider = Arc::new(provider);
        let coordinator = Coordinator::start(
            config,
            CoordinatorParts {
                db: db.clone(),
                locks,
                store: Some(store),
                provider: provider.clone(),
                notifier: Arc::new(RecordingNotifier::default()),
            },
        );
        Replica {
            coordinator,
            db,
            provider,
        }
    }

    fn seed_case(db: &Database, urls: &[&str]) -> (i64, Vec<i64>) {
        let case_id = db.create_case("Case under test").unwrap();
        let ids = urls
            .iter()
            .map(|url| db.add_recording(case_id, url).unwrap())
            .collect();
        (case_id, ids)
    }

    fn completed(outcome: DispatchOutcome) -> CaseTranscribed {
        match outcome {
            DispatchOutcome::Completed(signal) => signal,
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    async fn case_lock_is_free(locks: &dyn LockManager, case_id: i64) -> bool {
        let grant = locks.acquire(&case_lock_key(case_id), LONG).await.unwrap();
        if grant.acquired {
            locks.release(&case_lock_key(case_id), &grant.token).await.unwrap();
        }
        grant.acquired
    }

    const THREE_MIXED: [&str; 3] = [
        "https://audio.test/ok-1.mp3",
        "https://audio.test/fail-2.mp3",
        "https://audio.test/ok-3.mp3",
    ];

    const THREE_OK: [&str; 3] = [
        "https://audio.test/ok-1.mp3",
        "https://audio.test/ok-2.mp3",
        "https://audio.test/ok-3.mp3",
    ];

    // =========================================================================
    // End-to-end runs
    // =========================================================================

    #[tokio::test]
    async fn test_two_succeed_one_fails() {
        let notifier = Arc::new(RecordingNotifier::default());
        let h = memory_harness(ScriptedProvider::default(), notifier.clone());
        let (case_id, ids) = seed_case(&h.db, &THREE_MIXED);

        let signal = completed(h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap());

        assert_eq!(signal.case_id, case_id);
        assert_eq!(signal.total_recordings, 3);
        assert_eq!(signal.newly_transcribed, 2);
        assert_eq!(signal.failed_count, 1);
        assert_eq!(signal.cached_count, 0);
        assert_eq!(signal.failed_jobs.len(), 1);
        assert_eq!(signal.failed_jobs[0].job_id, ids[1]);
        assert!(signal.failed_jobs[0].error.contains("scripted failure"));

        assert!(case_lock_is_free(h.locks.as_ref(), case_id).await);
        let run_id = signal.run_id.clone().unwrap();
        let store = h.store.as_ref().unwrap();
        assert!(store.read_meta(&run_id).await.unwrap().is_none());

        let progress = h.db.case_progress(case_id).unwrap();
        assert_eq!((progress.transcribed, progress.failed), (2, 1));
        assert!(h.db.get_transcript(ids[0]).unwrap().is_some());
        assert!(h.db.get_transcript(ids[1]).unwrap().is_none());

        assert_eq!(notifier.count(EVENT_CASE_TRANSCRIBED).await, 1);
        assert_eq!(notifier.count(EVENT_CASE_PROGRESS).await, 2);

        let pool = h.coordinator.pool_state().await;
        assert_eq!((pool.completed, pool.failed, pool.cached), (2, 1, 0));
        assert!(!pool.is_processing());

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_pretranscribed_completes_immediately() {
        let notifier = Arc::new(RecordingNotifier::default());
        let h = memory_harness(ScriptedProvider::default(), notifier.clone());
        let (case_id, ids) = seed_case(&h.db, &THREE_OK);
        for id in &ids {
            h.db.save_transcript(case_id, *id, &TranscriptResult::default()).unwrap();
        }

        let outcome = h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap();
        match outcome {
            DispatchOutcome::AlreadyComplete(signal) => {
                assert_eq!(signal.newly_transcribed, 0);
                assert_eq!(signal.total_recordings, 3);
            }
            other => panic!("expected AlreadyComplete, got {:?}", other),
        }
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(notifier.count(EVENT_CASE_TRANSCRIBED).await, 1);
        assert!(case_lock_is_free(h.locks.as_ref(), case_id).await);

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_dispatch_sees_run_in_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let notifier = Arc::new(RecordingNotifier::default());
        let h = memory_harness(ScriptedProvider::gated(gate.clone()), notifier.clone());
        let (case_id, _) = seed_case(&h.db, &THREE_OK);
        let mut completions = h.coordinator.subscribe();

        let first = h
            .coordinator
            .dispatch(case_id, CompletionMode::FireAndForget)
            .await
            .unwrap();
        let first_run = match first {
            DispatchOutcome::Dispatched { run_id, target } => {
                assert_eq!(target, 3);
                run_id.unwrap()
            }
            other => panic!("expected Dispatched, got {:?}", other),
        };

        let second = h
            .coordinator
            .dispatch(case_id, CompletionMode::FireAndForget)
            .await
            .unwrap();
        assert_eq!(second, DispatchOutcome::InProgress);

        let coordinator = h.coordinator.clone();
        let waiter =
            tokio::spawn(async move { coordinator.dispatch(case_id, CompletionMode::Wait).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        gate.add_permits(3);
        let signal = CompletionBus::wait_for_case(&mut completions, case_id, LONG)
            .await
            .unwrap();
        assert_eq!(signal.run_id.as_deref(), Some(first_run.as_str()));
        assert_eq!(signal.newly_transcribed, 3);

        let waited = completed(waiter.await.unwrap().unwrap());
        assert_eq!(waited.run_id.as_deref(), Some(first_run.as_str()));

        assert_eq!(h.provider.calls(), 3);
        assert_eq!(notifier.count(EVENT_CASE_TRANSCRIBED).await, 1);

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_timeout_returns_stored_status() {
        let gate = Arc::new(Semaphore::new(0));
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir, BackendKind::Memory);
        config.wait_timeout_ms = Some(100);
        let h = start_harness(
            config,
            temp_dir,
            ScriptedProvider::gated(gate),
            Arc::new(RecordingNotifier::default()),
        );
        let (case_id, _) = seed_case(&h.db, &THREE_OK);

        let outcome = h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap();
        match outcome {
            DispatchOutcome::TimedOut(status) => {
                assert_eq!(status.case_id, case_id);
                assert_eq!(status.total, 3);
                assert_eq!(status.pending, 3);
            }
            other => panic!("expected TimedOut, got {:?}", other),
        }
        // The abandoned run keeps the case until its lock expires.
        assert!(!case_lock_is_free(h.locks.as_ref(), case_id).await);

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashed_job_lock_expires_and_job_is_retried() {
        let h = memory_harness(ScriptedProvider::default(), Arc::new(RecordingNotifier::default()));
        let (case_id, ids) = seed_case(&h.db, &THREE_OK);

        // A worker that died holding the job lock.
        let stale = h
            .locks
            .acquire(&job_lock_key(ids[2]), Duration::from_millis(150))
            .await
            .unwrap();
        assert!(stale.acquired);

        let first = completed(h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap());
        assert_eq!(first.newly_transcribed, 2);
        assert_eq!(first.cached_count, 1);
        assert!(!h.db.is_recording_transcribed(ids[2]).unwrap());
        assert!(case_lock_is_free(h.locks.as_ref(), case_id).await);

        tokio::time::sleep(Duration::from_millis(250)).await;

        let second = completed(h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap());
        assert_eq!(second.newly_transcribed, 1);
        assert_ne!(second.run_id, first.run_id);
        assert!(h.db.is_recording_transcribed(ids[2]).unwrap());
        assert!(h.db.case_progress(case_id).unwrap().is_complete());

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_notifier_still_releases_and_cleans_up() {
        let h = memory_harness(ScriptedProvider::default(), Arc::new(FailingNotifier));
        let (case_id, _) = seed_case(&h.db, &THREE_OK);

        let signal = completed(h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap());
        assert_eq!(signal.newly_transcribed, 3);

        assert!(case_lock_is_free(h.locks.as_ref(), case_id).await);
        let run_id = signal.run_id.unwrap();
        assert!(h.store.as_ref().unwrap().read_meta(&run_id).await.unwrap().is_none());

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_credentials_abort_before_lock() {
        let provider = ScriptedProvider {
            missing_credentials: true,
            ..Default::default()
        };
        let h = memory_harness(provider, Arc::new(RecordingNotifier::default()));
        let (case_id, _) = seed_case(&h.db, &THREE_OK);

        let err = h
            .coordinator
            .dispatch(case_id, CompletionMode::Wait)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, AppError::Config(_)));
        assert!(case_lock_is_free(h.locks.as_ref(), case_id).await);
        assert_eq!(h.provider.calls(), 0);

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_case_is_not_found() {
        let h = memory_harness(ScriptedProvider::default(), Arc::new(RecordingNotifier::default()));
        let err = h
            .coordinator
            .dispatch(4242, CompletionMode::FireAndForget)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_job_counts_as_failed() {
        let h = memory_harness(ScriptedProvider::default(), Arc::new(RecordingNotifier::default()));
        let (case_id, ids) = seed_case(
            &h.db,
            &["https://audio.test/ok-1.mp3", "https://audio.test/panic-2.mp3"],
        );

        let signal = completed(h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap());
        assert_eq!(signal.newly_transcribed, 1);
        assert_eq!(signal.failed_count, 1);
        assert_eq!(signal.failed_jobs[0].job_id, ids[1]);
        assert!(signal.failed_jobs[0].error.contains("panicked"));

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_per_case_concurrency_is_enforced() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir, BackendKind::Memory);
        config.per_case_concurrency = 1;
        let provider = ScriptedProvider {
            delay: Duration::from_millis(30),
            ..Default::default()
        };
        let h = start_harness(config, temp_dir, provider, Arc::new(RecordingNotifier::default()));
        let (case_id, _) = seed_case(&h.db, &THREE_OK);

        let signal = completed(h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap());
        assert_eq!(signal.newly_transcribed, 3);
        assert_eq!(h.provider.max_in_flight.load(Ordering::SeqCst), 1);

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_fallback_mode_polls_to_completion() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, BackendKind::None);
        let notifier = Arc::new(RecordingNotifier::default());
        let h = start_harness(config, temp_dir, ScriptedProvider::default(), notifier.clone());
        let (case_id, ids) = seed_case(&h.db, &THREE_MIXED);

        // A failure left over from an earlier attempt must not count as resolved.
        h.db.mark_recording_failed(ids[0], "old failure").unwrap();

        let signal = completed(h.coordinator.dispatch(case_id, CompletionMode::Wait).await.unwrap());
        assert!(signal.run_id.is_none());
        assert_eq!(signal.newly_transcribed, 2);
        assert_eq!(signal.failed_count, 1);
        assert_eq!(notifier.count(EVENT_CASE_TRANSCRIBED).await, 1);
        assert!(h.db.is_recording_transcribed(ids[0]).unwrap());

        h.coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_on_other_replica_returns_when_holder_finishes() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir, BackendKind::Sqlite);
        config.wait_timeout_ms = Some(20_000);
        let gate = Arc::new(Semaphore::new(0));
        let holder = sqlite_replica(&config, ScriptedProvider::gated(gate.clone()));
        let waiter = sqlite_replica(&config, ScriptedProvider::default());
        let (case_id, _) = seed_case(&holder.db, &THREE_OK);

        let first = holder
            .coordinator
            .dispatch(case_id, CompletionMode::FireAndForget)
            .await
            .unwrap();
        assert!(matches!(first, DispatchOutcome::Dispatched { target: 3, .. }));

        let waiter = Arc::new(waiter);
        let waiting = {
            let waiter = waiter.clone();
            tokio::spawn(async move { waiter.coordinator.dispatch(case_id, CompletionMode::Wait).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished(), "case is still held by the other replica");

        gate.add_permits(3);
        let outcome = tokio::time::timeout(Duration::from_secs(10), waiting)
            .await
            .expect("waiter should not run out its wait timeout")
            .unwrap()
            .unwrap();
        match outcome {
            DispatchOutcome::Settled(status) => {
                assert_eq!(status.transcribed, 3);
                assert_eq!(status.pending, 0);
            }
            other => panic!("expected Settled, got {:?}", other),
        }
        assert_eq!(waiter.provider.calls(), 0);
        assert_eq!(holder.provider.calls(), 3);

        holder.coordinator.shutdown().await;
        waiter.coordinator.shutdown().await;
    }

    // =========================================================================
    // Finalizer
    // =========================================================================

    /// Run-state store whose next `account_job` calls fail before touching
    /// anything, like a store that rolled the step back.
    struct FlakyStore {
        inner: MemoryRunStateStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryRunStateStore::new(LONG),
                failures: AtomicUsize::new(0),
            }
        }

        fn fail_next(&self, times: usize) {
            self.failures.store(times, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RunStateStore for FlakyStore {
        async fn create_run(&self, meta: &RunMeta, job_ids: &[i64]) -> AppResult<()> {
            self.inner.create_run(meta, job_ids).await
        }

        async fn account_job(
            &self,
            run_id: &str,
            job_id: i64,
            delta: CounterDelta,
            error: Option<&str>,
        ) -> AppResult<Option<Accounted>> {
            let should_fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(AppError::Coordination("database is locked".to_string()));
            }
            self.inner.account_job(run_id, job_id, delta, error).await
        }

        async fn read_pending_count(&self, run_id: &str) -> AppResult<usize> {
            self.inner.read_pending_count(run_id).await
        }

        async fn read_meta(&self, run_id: &str) -> AppResult<Option<RunMeta>> {
            self.inner.read_meta(run_id).await
        }

        async fn read_counters(&self, run_id: &str) -> AppResult<RunCounters> {
            self.inner.read_counters(run_id).await
        }

        async fn read_failed(&self, run_id: &str) -> AppResult<Vec<FailedJob>> {
            self.inner.read_failed(run_id).await
        }

        async fn finalize_once(&self, run_id: &str) -> AppResult<bool> {
            self.inner.finalize_once(run_id).await
        }

        async fn delete_run(&self, run_id: &str) -> AppResult<()> {
            self.inner.delete_run(run_id).await
        }

        async fn purge_expired(&self) -> AppResult<usize> {
            self.inner.purge_expired().await
        }
    }

    struct FinalizerFixture {
        db: Arc<Database>,
        locks: Arc<MemoryLockManager>,
        case_id: i64,
        job_ids: Vec<i64>,
        _temp_dir: TempDir,
    }

    fn finalizer_fixture() -> FinalizerFixture {
        finalizer_fixture_with(&THREE_OK[..2])
    }

    fn finalizer_fixture_with(urls: &[&str]) -> FinalizerFixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp_dir.path().join("cases.db")).unwrap());
        let (case_id, job_ids) = seed_case(&db, urls);
        FinalizerFixture {
            db,
            locks: Arc::new(MemoryLockManager::new()),
            case_id,
            job_ids,
            _temp_dir: temp_dir,
        }
    }

    fn finalizer_for(
        fx: &FinalizerFixture,
        store: Arc<dyn RunStateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Finalizer {
        finalizer_with(fx, store, notifier, CompletionBus::default(), 1)
    }

    fn finalizer_with(
        fx: &FinalizerFixture,
        store: Arc<dyn RunStateStore>,
        notifier: Arc<dyn Notifier>,
        bus: CompletionBus,
        progress_every: usize,
    ) -> Finalizer {
        Finalizer::new(fx.db.clone(), fx.locks.clone(), store, notifier, bus, progress_every)
    }

    async fn open_run(fx: &FinalizerFixture, store: &dyn RunStateStore, run_id: &str) {
        let grant = fx.locks.acquire(&case_lock_key(fx.case_id), LONG).await.unwrap();
        let meta = RunMeta {
            run_id: run_id.to_string(),
            case_id: fx.case_id,
            total_recordings: fx.job_ids.len() as i64,
            already_transcribed: 0,
            target: fx.job_ids.len() as i64,
            lock_token: grant.token,
            started_at: Utc::now(),
        };
        store.create_run(&meta, &fx.job_ids).await.unwrap();
    }

    fn finished(run_id: &str, case_id: i64, job_id: i64, outcome: JobOutcome) -> JobFinished {
        JobFinished {
            run_id: Some(run_id.to_string()),
            case_id,
            job_id,
            outcome,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_replayed_signal_changes_counters_once() {
        let fx = finalizer_fixture();
        let store = Arc::new(MemoryRunStateStore::new(LONG));
        let notifier = Arc::new(RecordingNotifier::default());
        let finalizer = finalizer_for(&fx, store.clone(), notifier.clone());
        open_run(&fx, store.as_ref(), "run-1").await;

        let first = finished("run-1", fx.case_id, fx.job_ids[0], JobOutcome::Ok);
        assert_eq!(
            finalizer.handle(&first).await.unwrap(),
            FinalizeStep::Progress { pending: 1 }
        );
        for _ in 0..3 {
            assert_eq!(finalizer.handle(&first).await.unwrap(), FinalizeStep::Duplicate);
        }
        assert_eq!(store.read_counters("run-1").await.unwrap().processed, 1);

        let last = finished("run-1", fx.case_id, fx.job_ids[1], JobOutcome::Cached);
        let signal = match finalizer.handle(&last).await.unwrap() {
            FinalizeStep::Finalized(signal) => signal,
            other => panic!("expected Finalized, got {:?}", other),
        };
        assert_eq!(signal.newly_transcribed, 1);
        assert_eq!(signal.cached_count, 1);

        assert_eq!(finalizer.handle(&last).await.unwrap(), FinalizeStep::Duplicate);
        assert_eq!(notifier.count(EVENT_CASE_TRANSCRIBED).await, 1);
        assert!(case_lock_is_free(fx.locks.as_ref(), fx.case_id).await);
    }

    #[tokio::test]
    async fn test_untracked_signal_is_ignored() {
        let fx = finalizer_fixture();
        let finalizer = finalizer_for(
            &fx,
            Arc::new(MemoryRunStateStore::new(LONG)),
            Arc::new(RecordingNotifier::default()),
        );
        let signal = JobFinished {
            run_id: None,
            case_id: fx.case_id,
            job_id: fx.job_ids[0],
            outcome: JobOutcome::Ok,
            error: None,
        };
        assert_eq!(finalizer.handle(&signal).await.unwrap(), FinalizeStep::Untracked);
    }

    fn sqlite_replicas(fx: &FinalizerFixture) -> (Arc<SqliteCoordination>, Arc<SqliteCoordination>) {
        let path = fx._temp_dir.path().join("coordination.db");
        let open = || Arc::new(SqliteCoordination::open(&path, LONG, Duration::from_secs(5)).unwrap());
        (open(), open())
    }

    #[tokio::test]
    async fn test_two_replicas_interleaved_finalize_once() {
        let fx = finalizer_fixture();
        let (replica_a, replica_b) = sqlite_replicas(&fx);
        let notifier = Arc::new(RecordingNotifier::default());
        open_run(&fx, replica_a.as_ref(), "run-shared").await;
        let finalizer_a = finalizer_for(&fx, replica_a, notifier.clone());
        let finalizer_b = finalizer_for(&fx, replica_b, notifier.clone());

        let ok = finished("run-shared", fx.case_id, fx.job_ids[0], JobOutcome::Ok);
        let failed = JobFinished {
            error: Some("provider 500".to_string()),
            ..finished("run-shared", fx.case_id, fx.job_ids[1], JobOutcome::Failed)
        };

        assert_eq!(
            finalizer_a.handle(&ok).await.unwrap(),
            FinalizeStep::Progress { pending: 1 }
        );
        // The same signal redelivered to the other replica.
        assert_eq!(finalizer_b.handle(&ok).await.unwrap(), FinalizeStep::Duplicate);

        let signal = match finalizer_b.handle(&failed).await.unwrap() {
            FinalizeStep::Finalized(signal) => signal,
            other => panic!("expected Finalized, got {:?}", other),
        };
        assert_eq!(signal.newly_transcribed, 1);
        assert_eq!(signal.failed_count, 1);
        assert_eq!(signal.failed_jobs[0].job_id, fx.job_ids[1]);
        assert_eq!(signal.failed_jobs[0].error, "provider 500");

        assert_eq!(finalizer_a.handle(&failed).await.unwrap(), FinalizeStep::Duplicate);
        assert_eq!(notifier.count(EVENT_CASE_TRANSCRIBED).await, 1);
        assert!(case_lock_is_free(fx.locks.as_ref(), fx.case_id).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_replicas_racing_finalize_once() {
        let fx = finalizer_fixture();
        let (replica_a, replica_b) = sqlite_replicas(&fx);
        let notifier = Arc::new(RecordingNotifier::default());
        open_run(&fx, replica_a.as_ref(), "run-shared").await;

        let finalizer_a = Arc::new(finalizer_for(&fx, replica_a, notifier.clone()));
        let finalizer_b = Arc::new(finalizer_for(&fx, replica_b, notifier.clone()));
        let signal_a = finished("run-shared", fx.case_id, fx.job_ids[0], JobOutcome::Ok);
        let signal_b = finished("run-shared", fx.case_id, fx.job_ids[1], JobOutcome::Ok);

        let a = tokio::spawn(async move { finalizer_a.handle(&signal_a).await.unwrap() });
        let b = tokio::spawn(async move { finalizer_b.handle(&signal_b).await.unwrap() });
        let steps = [a.await.unwrap(), b.await.unwrap()];

        // Whichever replica drained the pending set counted both jobs.
        assert!(steps.contains(&FinalizeStep::Progress { pending: 1 }), "steps: {:?}", steps);
        let finalized: Vec<_> = steps
            .iter()
            .filter_map(|s| match s {
                FinalizeStep::Finalized(signal) => Some(signal),
                _ => None,
            })
            .collect();
        assert_eq!(finalized.len(), 1, "steps: {:?}", steps);
        assert_eq!(finalized[0].newly_transcribed, 2);
        assert_eq!(notifier.count(EVENT_CASE_TRANSCRIBED).await, 1);
    }

    #[tokio::test]
    async fn test_store_error_leaves_signal_redeliverable() {
        let fx = finalizer_fixture();
        let store = Arc::new(FlakyStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let finalizer = finalizer_for(&fx, store.clone(), notifier.clone());
        open_run(&fx, store.as_ref(), "run-flaky").await;

        let first = finished("run-flaky", fx.case_id, fx.job_ids[0], JobOutcome::Ok);
        finalizer.handle(&first).await.unwrap();

        let last = finished("run-flaky", fx.case_id, fx.job_ids[1], JobOutcome::Ok);
        store.fail_next(1);
        assert!(finalizer.handle(&last).await.is_err());
        assert_eq!(store.read_pending_count("run-flaky").await.unwrap(), 1);
        assert_eq!(store.read_counters("run-flaky").await.unwrap().processed, 1);
        assert!(!case_lock_is_free(fx.locks.as_ref(), fx.case_id).await);

        let signal = match finalizer.handle(&last).await.unwrap() {
            FinalizeStep::Finalized(signal) => signal,
            other => panic!("expected Finalized, got {:?}", other),
        };
        assert_eq!(signal.newly_transcribed, 2);
        assert_eq!(notifier.count(EVENT_CASE_TRANSCRIBED).await, 1);
        assert!(case_lock_is_free(fx.locks.as_ref(), fx.case_id).await);
    }

    #[tokio::test]
    async fn test_finalize_task_retries_after_store_error() {
        let fx = finalizer_fixture();
        let store = Arc::new(FlakyStore::new());
        let bus = CompletionBus::default();
        let mut completions = bus.subscribe();
        let finalizer = Arc::new(finalizer_with(
            &fx,
            store.clone(),
            Arc::new(RecordingNotifier::default()),
            bus,
            1,
        ));
        open_run(&fx, store.as_ref(), "run-retry").await;

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(finalize_task(finalizer, rx, CancellationToken::new()));
        store.fail_next(2);
        for job_id in &fx.job_ids {
            tx.send(finished("run-retry", fx.case_id, *job_id, JobOutcome::Ok))
                .await
                .unwrap();
        }

        let signal = CompletionBus::wait_for_case(&mut completions, fx.case_id, LONG)
            .await
            .unwrap();
        assert_eq!(signal.newly_transcribed, 2);
        assert!(case_lock_is_free(fx.locks.as_ref(), fx.case_id).await);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_throttled_progress_reports_step_before_last() {
        let fx = finalizer_fixture_with(&THREE_OK);
        let store = Arc::new(MemoryRunStateStore::new(LONG));
        let notifier = Arc::new(RecordingNotifier::default());
        let finalizer =
            finalizer_with(&fx, store.clone(), notifier.clone(), CompletionBus::default(), 10);
        open_run(&fx, store.as_ref(), "run-quiet").await;

        let step = |job_id| finished("run-quiet", fx.case_id, job_id, JobOutcome::Ok);
        finalizer.handle(&step(fx.job_ids[0])).await.unwrap();
        assert_eq!(notifier.count(EVENT_CASE_PROGRESS).await, 0);

        finalizer.handle(&step(fx.job_ids[1])).await.unwrap();
        let progress = notifier.payloads(EVENT_CASE_PROGRESS).await;
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0]["pending"], 1);
        assert_eq!(progress[0]["processed"], 2);

        assert!(matches!(
            finalizer.handle(&step(fx.job_ids[2])).await.unwrap(),
            FinalizeStep::Finalized(_)
        ));
        assert_eq!(notifier.count(EVENT_CASE_PROGRESS).await, 1);
    }
}
