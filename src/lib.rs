pub mod config;
pub mod coordination;
pub mod database;
pub mod error;
pub mod notify;
pub mod provider;
pub mod worker;

use config::{BackendKind, CoordinatorConfig};
use coordination::{
    DisabledLockManager, LockManager, MemoryLockManager, MemoryRunStateStore, RunStateStore,
    SqliteCoordination,
};
use database::Database;
use error::AppResult;
use futures_util::future::join_all;
use notify::{CompletionBus, LogNotifier, Notifier, WebhookNotifier};
use provider::{HttpTranscriptionProvider, TranscriptionProvider};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::dispatch::{CaseStatus, CompletionMode, DispatchOutcome, DispatchSettings, Dispatcher};
use worker::events::{CaseTranscribed, JobFinished, TranscribeTask};
use worker::transcribe::JobWorker;
use worker::{PoolLimits, PoolState, WorkerPool};

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
/// `log` records from the library are forwarded to it.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        log::debug!("Logging already initialised");
    }
}

/// The collaborators a [`Coordinator`] runs on.
pub struct CoordinatorParts {
    pub db: Arc<Database>,
    pub locks: Arc<dyn LockManager>,
    /// `None` selects the polling fallback.
    pub store: Option<Arc<dyn RunStateStore>>,
    pub provider: Arc<dyn TranscriptionProvider>,
    pub notifier: Arc<dyn Notifier>,
}

/// One replica: dispatcher, worker pool, finalizer and sweeper.
pub struct Coordinator {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    bus: CompletionBus,
    pool_state: Arc<RwLock<PoolState>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build every collaborator from configuration and start the background
    /// tasks. Must be called inside a tokio runtime.
    pub fn from_config(config: &CoordinatorConfig) -> AppResult<Self> {
        config.validate()?;
        let db = Arc::new(Database::new(&config.database_path)?);

        let (locks, store): (Arc<dyn LockManager>, Option<Arc<dyn RunStateStore>>) =
            match config.backend {
                BackendKind::Memory => {
                    let locks: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
                    let store: Arc<dyn RunStateStore> =
                        Arc::new(MemoryRunStateStore::new(config.case_lock_ttl()));
                    (locks, Some(store))
                }
                BackendKind::Sqlite => {
                    let shared = Arc::new(SqliteCoordination::open(
                        &config.coordination_path(),
                        config.case_lock_ttl(),
                        config.store_timeout(),
                    )?);
                    let locks: Arc<dyn LockManager> = shared.clone();
                    let store: Arc<dyn RunStateStore> = shared;
                    (locks, Some(store))
                }
                BackendKind::None => {
                    log::warn!(
                        "No shared coordination backend: locks disabled, completion detected by polling"
                    );
                    let locks: Arc<dyn LockManager> = Arc::new(DisabledLockManager);
                    (locks, None)
                }
            };

        let provider: Arc<dyn TranscriptionProvider> = Arc::new(HttpTranscriptionProvider::with_timeout(
            &config.provider,
            config.provider_timeout(),
        ));
        let notifier: Arc<dyn Notifier> = match config.notify_webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Arc::new(WebhookNotifier::new(url)),
            _ => Arc::new(LogNotifier),
        };

        Ok(Self::start(
            config,
            CoordinatorParts {
                db,
                locks,
                store,
                provider,
                notifier,
            },
        ))
    }

    /// Start the background tasks around explicit collaborators.
    pub fn start(config: &CoordinatorConfig, parts: CoordinatorParts) -> Self {
        let CoordinatorParts {
            db,
            locks,
            store,
            provider,
            notifier,
        } = parts;

        let cancel = CancellationToken::new();
        let bus = CompletionBus::new(config.queue_capacity);
        let pool_state = Arc::new(RwLock::new(PoolState::default()));
        let (task_tx, task_rx) = mpsc::channel::<TranscribeTask>(config.queue_capacity.max(1));
        let (finished_tx, finished_rx) = mpsc::channel::<JobFinished>(config.queue_capacity.max(1));
        let mut handles = Vec::new();

        let job_worker = Arc::new(JobWorker::new(
            db.clone(),
            locks.clone(),
            provider.clone(),
            config.job_lock_ttl(),
            config.provider_timeout(),
        ));
        let pool = WorkerPool::new(
            job_worker,
            pool_state.clone(),
            PoolLimits {
                max_concurrency: config.max_concurrency,
                per_case_concurrency: config.per_case_concurrency,
            },
        );
        handles.push(tokio::spawn(pool.run(task_rx, finished_tx, cancel.clone())));

        match store.clone() {
            Some(store) => {
                let finalizer = Arc::new(worker::finalize::Finalizer::new(
                    db.clone(),
                    locks.clone(),
                    store,
                    notifier.clone(),
                    bus.clone(),
                    config.progress_every,
                ));
                handles.push(tokio::spawn(worker::finalize::finalize_task(
                    finalizer,
                    finished_rx,
                    cancel.clone(),
                )));
            }
            None => {
                handles.push(tokio::spawn(worker::finalize::drain_untracked(
                    finished_rx,
                    cancel.clone(),
                )));
            }
        }

        handles.push(tokio::spawn(worker::sweep::sweep_task(
            locks.clone(),
            store.clone(),
            config.sweep_interval(),
            cancel.clone(),
        )));

        let dispatcher = Dispatcher::new(
            db.clone(),
            locks,
            store,
            provider,
            notifier,
            bus.clone(),
            task_tx,
            DispatchSettings {
                case_lock_ttl: config.case_lock_ttl(),
                wait_timeout: config.wait_timeout(),
                poll_interval: config.poll_interval(),
            },
        );

        log::info!(
            "Coordinator started (backend {:?}, concurrency {}/{} per case)",
            config.backend,
            config.max_concurrency,
            config.per_case_concurrency
        );

        Self {
            db,
            dispatcher,
            bus,
            pool_state,
            cancel,
            handles: Mutex::new(handles),
        }
    }

    /// Transcribe every pending recording of `case_id`.
    pub async fn dispatch(&self, case_id: i64, mode: CompletionMode) -> AppResult<DispatchOutcome> {
        self.dispatcher.dispatch(case_id, mode).await
    }

    /// Terminal signals published in this process from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CaseTranscribed> {
        self.bus.subscribe()
    }

    pub fn case_status(&self, case_id: i64) -> AppResult<CaseStatus> {
        self.dispatcher.case_status(case_id)
    }

    pub async fn pool_state(&self) -> PoolState {
        self.pool_state.read().await.clone()
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Stop background tasks and wait for them. In-flight runs are abandoned
    /// to their TTLs.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                log::error!("Background task ended abnormally: {}", e);
            }
        }
        log::info!("Coordinator stopped");
    }
}
