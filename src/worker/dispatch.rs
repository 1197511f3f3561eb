//! Fan-out: turn a case into one task per pending recording.
//!
//! The case lock is taken before any run state is written, so at most one
//! dispatch attempt per case creates a run. The completion bus is subscribed
//! before the lock is taken, so a terminal signal can never be published in
//! the gap between the two.

use crate::coordination::{case_lock_key, LockGrant, LockManager, RunMeta, RunStateStore};
use crate::database::{CaseProgress, CaseRecording, Database};
use crate::error::{AppError, AppResult};
use crate::notify::{notify_best_effort, CompletionBus, Notifier, EVENT_CASE_TRANSCRIBED};
use crate::provider::TranscriptionProvider;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use super::events::{CaseTranscribed, TranscribeTask, EVENT_JOB_TRANSCRIBE};
use super::poll::FallbackPoller;

const LOCAL_PUBLISH_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Block (bounded) until the terminal signal arrives.
    Wait,
    /// Return as soon as the tasks are queued.
    FireAndForget,
}

/// Best-effort status read straight from the persistent store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseStatus {
    pub case_id: i64,
    pub total: i64,
    pub transcribed: i64,
    pub failed: i64,
    pub pending: i64,
}

impl CaseStatus {
    pub fn from_progress(case_id: i64, progress: &CaseProgress) -> Self {
        Self {
            case_id,
            total: progress.total,
            transcribed: progress.transcribed,
            failed: progress.failed,
            pending: progress.pending(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing was pending; the terminal signal was emitted immediately.
    AlreadyComplete(CaseTranscribed),
    /// The terminal signal for this case arrived while waiting.
    Completed(CaseTranscribed),
    /// Tasks were queued and the caller did not wait.
    Dispatched { run_id: Option<String>, target: i64 },
    /// Another dispatch attempt holds the case.
    InProgress,
    /// The attempt holding the case let go (finished on another replica, or
    /// expired) without a terminal signal reaching this process; stored
    /// status attached.
    Settled(CaseStatus),
    /// No terminal signal within the wait bound; stored status attached.
    TimedOut(CaseStatus),
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub case_lock_ttl: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

pub struct Dispatcher {
    db: Arc<Database>,
    locks: Arc<dyn LockManager>,
    store: Option<Arc<dyn RunStateStore>>,
    provider: Arc<dyn TranscriptionProvider>,
    notifier: Arc<dyn Notifier>,
    bus: CompletionBus,
    tasks: mpsc::Sender<TranscribeTask>,
    settings: DispatchSettings,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        locks: Arc<dyn LockManager>,
        store: Option<Arc<dyn RunStateStore>>,
        provider: Arc<dyn TranscriptionProvider>,
        notifier: Arc<dyn Notifier>,
        bus: CompletionBus,
        tasks: mpsc::Sender<TranscribeTask>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            db,
            locks,
            store,
            provider,
            notifier,
            bus,
            tasks,
            settings,
        }
    }

    pub fn case_status(&self, case_id: i64) -> AppResult<CaseStatus> {
        let progress = self.db.case_progress(case_id)?;
        Ok(CaseStatus::from_progress(case_id, &progress))
    }

    #[tracing::instrument(skip(self))]
    pub async fn dispatch(&self, case_id: i64, mode: CompletionMode) -> AppResult<DispatchOutcome> {
        // Fatal prerequisites abort before any lock is taken.
        self.provider.check_ready()?;

        if self.db.get_case(case_id)?.is_none() {
            return Err(AppError::NotFound(format!("case {}", case_id)));
        }
        let recordings = self.db.get_case_recordings(case_id)?;
        let total = recordings.len() as i64;
        let (done, pending): (Vec<CaseRecording>, Vec<CaseRecording>) =
            recordings.into_iter().partition(|r| r.already_done);

        if pending.is_empty() {
            log::info!("Case {}: all {} recordings already transcribed", case_id, total);
            let signal = CaseTranscribed::nothing_pending(case_id, total);
            self.emit_terminal(&signal).await;
            return Ok(DispatchOutcome::AlreadyComplete(signal));
        }

        let mut completions = self.bus.subscribe();
        let grant = self
            .locks
            .acquire(&case_lock_key(case_id), self.settings.case_lock_ttl)
            .await?;

        if !grant.acquired {
            log::info!("Case {} is already being dispatched", case_id);
            return match mode {
                CompletionMode::FireAndForget => Ok(DispatchOutcome::InProgress),
                CompletionMode::Wait => self.wait_for_holder(&mut completions, case_id).await,
            };
        }

        match self.store.clone() {
            Some(store) => {
                let already_transcribed = done.len() as i64;
                self.dispatch_tracked(
                    store,
                    grant,
                    case_id,
                    total,
                    already_transcribed,
                    pending,
                    mode,
                    completions,
                )
                .await
            }
            None => self.dispatch_untracked(grant, case_id, pending, mode).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tracked(
        &self,
        store: Arc<dyn RunStateStore>,
        grant: LockGrant,
        case_id: i64,
        total: i64,
        already_transcribed: i64,
        pending: Vec<CaseRecording>,
        mode: CompletionMode,
        mut completions: broadcast::Receiver<CaseTranscribed>,
    ) -> AppResult<DispatchOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let target = pending.len() as i64;
        let job_ids: Vec<i64> = pending.iter().map(|r| r.job_id).collect();
        let meta = RunMeta {
            run_id: run_id.clone(),
            case_id,
            total_recordings: total,
            already_transcribed,
            target,
            lock_token: grant.token.clone(),
            started_at: Utc::now(),
        };

        if let Err(e) = store.create_run(&meta, &job_ids).await {
            self.release_case_lock(case_id, &grant).await;
            return Err(e);
        }
        if let Err(e) = self.db.mark_recordings_queued(&job_ids) {
            log::warn!("Case {}: failed to mark recordings queued: {}", case_id, e);
        }

        let run = Some(run_id.clone());
        if let Err(e) = self.send_tasks(&run, case_id, &pending).await {
            if let Err(cleanup) = store.delete_run(&run_id).await {
                log::warn!("Run {}: cleanup after failed dispatch: {}", run_id, cleanup);
            }
            self.release_case_lock(case_id, &grant).await;
            return Err(e);
        }

        log::info!(
            "Case {}: run {} dispatched {} of {} recordings ({} already transcribed)",
            case_id,
            run_id,
            target,
            total,
            already_transcribed
        );

        match mode {
            CompletionMode::FireAndForget => Ok(DispatchOutcome::Dispatched {
                run_id: Some(run_id),
                target,
            }),
            // On timeout the lock is left to expire with the abandoned run.
            CompletionMode::Wait => self.wait_for_terminal(&mut completions, case_id).await,
        }
    }

    async fn dispatch_untracked(
        &self,
        grant: LockGrant,
        case_id: i64,
        pending: Vec<CaseRecording>,
        mode: CompletionMode,
    ) -> AppResult<DispatchOutcome> {
        let target = pending.len() as i64;
        let job_ids: Vec<i64> = pending.iter().map(|r| r.job_id).collect();

        // Stale failures from an earlier attempt must not count as resolved.
        self.db.mark_recordings_queued(&job_ids)?;
        if let Err(e) = self.send_tasks(&None, case_id, &pending).await {
            self.release_case_lock(case_id, &grant).await;
            return Err(e);
        }
        log::info!(
            "Case {}: dispatched {} recordings without run state, polling for completion",
            case_id,
            target
        );

        let poller = FallbackPoller::new(
            self.db.clone(),
            self.locks.clone(),
            self.notifier.clone(),
            self.bus.clone(),
            self.settings.poll_interval,
            self.settings.wait_timeout,
        );

        match mode {
            CompletionMode::Wait => match poller.watch(case_id, job_ids, grant).await? {
                Some(signal) => Ok(DispatchOutcome::Completed(signal)),
                None => Ok(DispatchOutcome::TimedOut(self.case_status(case_id)?)),
            },
            CompletionMode::FireAndForget => {
                tokio::spawn(async move {
                    if let Err(e) = poller.watch(case_id, job_ids, grant).await {
                        log::error!("Case {}: fallback poller failed: {}", case_id, e);
                    }
                });
                Ok(DispatchOutcome::Dispatched {
                    run_id: None,
                    target,
                })
            }
        }
    }

    async fn send_tasks(
        &self,
        run_id: &Option<String>,
        case_id: i64,
        pending: &[CaseRecording],
    ) -> AppResult<()> {
        let total = pending.len() as i64;
        for (position, recording) in pending.iter().enumerate() {
            let task = TranscribeTask {
                run_id: run_id.clone(),
                case_id,
                job_id: recording.job_id,
                recording_ref: recording.audio_url.clone(),
                position: position as i64,
                total,
            };
            log::debug!("{} case={} job={}", EVENT_JOB_TRANSCRIBE, case_id, recording.job_id);
            self.tasks
                .send(task)
                .await
                .map_err(|_| AppError::QueueClosed("transcription task queue".to_string()))?;
        }
        Ok(())
    }

    async fn wait_for_terminal(
        &self,
        completions: &mut broadcast::Receiver<CaseTranscribed>,
        case_id: i64,
    ) -> AppResult<DispatchOutcome> {
        match CompletionBus::wait_for_case(completions, case_id, self.settings.wait_timeout).await {
            Some(signal) => Ok(DispatchOutcome::Completed(signal)),
            None => self.timed_out(case_id),
        }
    }

    fn timed_out(&self, case_id: i64) -> AppResult<DispatchOutcome> {
        log::warn!(
            "Case {}: no completion within {:?}, returning stored status",
            case_id,
            self.settings.wait_timeout
        );
        Ok(DispatchOutcome::TimedOut(self.case_status(case_id)?))
    }

    /// Wait on a case held by another attempt, which may belong to another
    /// replica whose terminal signal never reaches this process's bus. The
    /// shared case lock is checked every poll interval and the wait ends once
    /// it is free.
    async fn wait_for_holder(
        &self,
        completions: &mut broadcast::Receiver<CaseTranscribed>,
        case_id: i64,
    ) -> AppResult<DispatchOutcome> {
        let key = case_lock_key(case_id);
        let deadline = Instant::now() + self.settings.wait_timeout;
        let tick = self.settings.poll_interval.max(Duration::from_millis(1));

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.timed_out(case_id);
            }
            if let Some(signal) =
                CompletionBus::wait_for_case(completions, case_id, remaining.min(tick)).await
            {
                return Ok(DispatchOutcome::Completed(signal));
            }
            if self.locks.is_held(&key).await? {
                continue;
            }

            // A holder in this process publishes right after releasing.
            if let Some(signal) =
                CompletionBus::wait_for_case(completions, case_id, LOCAL_PUBLISH_GRACE).await
            {
                return Ok(DispatchOutcome::Completed(signal));
            }
            log::info!("Case {}: the attempt holding it has let go", case_id);
            return Ok(DispatchOutcome::Settled(self.case_status(case_id)?));
        }
    }

    async fn emit_terminal(&self, signal: &CaseTranscribed) {
        if let Err(e) = self.db.mark_case_finished(signal.case_id) {
            log::warn!("Case {}: failed to record finish: {}", signal.case_id, e);
        }
        match serde_json::to_value(signal) {
            Ok(payload) => {
                notify_best_effort(self.notifier.as_ref(), EVENT_CASE_TRANSCRIBED, payload).await
            }
            Err(e) => log::warn!("Case {}: unserializable terminal signal: {}", signal.case_id, e),
        }
        self.bus.publish(signal.clone());
    }

    async fn release_case_lock(&self, case_id: i64, grant: &LockGrant) {
        if let Err(e) = self.locks.release(&case_lock_key(case_id), &grant.token).await {
            log::warn!("Case {}: failed to release lock: {}", case_id, e);
        }
    }
}
