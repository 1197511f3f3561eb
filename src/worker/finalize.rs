//! Fan-in: account `job.finished` signals against their run and finalize the
//! run exactly once when its pending set drains.
//!
//! Accounting a job (pending-set removal, failed set, counters and TTL) is one
//! atomic store step and the gate for duplicates: a signal whose job id is no
//! longer pending has already been counted and is dropped without side
//! effects. A failed step leaves the job pending for the redelivered signal. The finalize-once flag, not the zero read, decides which replica
//! performs the terminal actions.

use crate::coordination::{case_lock_key, CounterDelta, LockManager, ReleaseOutcome, RunStateStore};
use crate::database::Database;
use crate::error::AppResult;
use crate::notify::{
    notify_best_effort, CompletionBus, Notifier, EVENT_CASE_PROGRESS, EVENT_CASE_TRANSCRIBED,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::events::{CaseProgressEvent, CaseTranscribed, JobFinished, JobOutcome, EVENT_JOB_FINISHED};

/// What handling one signal amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeStep {
    /// Signal carries no run id (fallback mode).
    Untracked,
    /// Job already accounted for, or the run no longer exists.
    Duplicate,
    /// Counted; `pending` jobs remain.
    Progress { pending: usize },
    /// Another replica won the finalize flag.
    LostRace,
    /// The run state vanished (TTL) between the last job and finalization.
    Expired,
    Finalized(CaseTranscribed),
}

pub struct Finalizer {
    db: Arc<Database>,
    locks: Arc<dyn LockManager>,
    store: Arc<dyn RunStateStore>,
    notifier: Arc<dyn Notifier>,
    bus: CompletionBus,
    progress_every: i64,
}

impl Finalizer {
    pub fn new(
        db: Arc<Database>,
        locks: Arc<dyn LockManager>,
        store: Arc<dyn RunStateStore>,
        notifier: Arc<dyn Notifier>,
        bus: CompletionBus,
        progress_every: usize,
    ) -> Self {
        Self {
            db,
            locks,
            store,
            notifier,
            bus,
            progress_every: progress_every.max(1) as i64,
        }
    }

    /// Account one signal. Callers must not run two signals of the same run
    /// concurrently; [`finalize_task`] enforces that.
    #[tracing::instrument(skip(self, signal), fields(case_id = signal.case_id, job_id = signal.job_id))]
    pub async fn handle(&self, signal: &JobFinished) -> AppResult<FinalizeStep> {
        let Some(run_id) = signal.run_id.as_deref() else {
            return Ok(FinalizeStep::Untracked);
        };

        let delta = CounterDelta {
            processed: 1,
            cached: i64::from(signal.outcome == JobOutcome::Cached),
            failed: i64::from(signal.outcome == JobOutcome::Failed),
        };
        let error = (signal.outcome == JobOutcome::Failed)
            .then(|| signal.error.as_deref().unwrap_or("unknown error"));

        let Some(accounted) = self
            .store
            .account_job(run_id, signal.job_id, delta, error)
            .await?
        else {
            log::debug!("Run {}: ignoring repeated signal for job {}", run_id, signal.job_id);
            return Ok(FinalizeStep::Duplicate);
        };

        let pending = accounted.pending;
        if pending > 0 {
            let processed = accounted.counters.processed;
            // The step before the last is always reported.
            if processed % self.progress_every == 0 || pending == 1 {
                let progress = CaseProgressEvent {
                    case_id: signal.case_id,
                    run_id: Some(run_id.to_string()),
                    processed,
                    target: processed + pending as i64,
                    pending: pending as i64,
                };
                if let Ok(payload) = serde_json::to_value(&progress) {
                    notify_best_effort(self.notifier.as_ref(), EVENT_CASE_PROGRESS, payload).await;
                }
            }
            return Ok(FinalizeStep::Progress { pending });
        }

        if !self.store.finalize_once(run_id).await? {
            log::info!("Run {} already finalized elsewhere", run_id);
            return Ok(FinalizeStep::LostRace);
        }

        self.finalize(run_id).await
    }

    async fn finalize(&self, run_id: &str) -> AppResult<FinalizeStep> {
        let Some(meta) = self.store.read_meta(run_id).await? else {
            log::warn!("Run {} won finalize but its state is gone", run_id);
            return Ok(FinalizeStep::Expired);
        };
        let counters = self.store.read_counters(run_id).await?;
        let failed_jobs = self.store.read_failed(run_id).await?;

        let signal = CaseTranscribed {
            case_id: meta.case_id,
            run_id: Some(run_id.to_string()),
            total_recordings: meta.total_recordings,
            newly_transcribed: counters.newly_transcribed(),
            cached_count: counters.cached,
            failed_count: counters.failed,
            duration_ms: (Utc::now() - meta.started_at).num_milliseconds().max(0),
            failed_jobs,
        };
        log::info!(
            "Case {} run {} finished: {} new, {} cached, {} failed in {}ms",
            signal.case_id,
            run_id,
            signal.newly_transcribed,
            signal.cached_count,
            signal.failed_count,
            signal.duration_ms
        );

        // Nothing below may stop the lock release or the cleanup.
        if let Err(e) = self.db.mark_case_finished(meta.case_id) {
            log::warn!("Case {}: failed to record finish: {}", meta.case_id, e);
        }
        match serde_json::to_value(&signal) {
            Ok(payload) => {
                notify_best_effort(self.notifier.as_ref(), EVENT_CASE_TRANSCRIBED, payload).await
            }
            Err(e) => log::warn!("Run {}: unserializable terminal signal: {}", run_id, e),
        }

        match self
            .locks
            .release(&case_lock_key(meta.case_id), &meta.lock_token)
            .await
        {
            Ok(ReleaseOutcome::Released) => {}
            Ok(ReleaseOutcome::Stale) => {
                log::warn!("Case {} lock expired before run {} finished", meta.case_id, run_id)
            }
            Err(e) => log::error!("Case {}: failed to release lock: {}", meta.case_id, e),
        }
        if let Err(e) = self.store.delete_run(run_id).await {
            log::error!("Run {}: failed to delete run state: {}", run_id, e);
        }

        self.bus.publish(signal.clone());
        Ok(FinalizeStep::Finalized(signal))
    }
}

type Lanes = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

const DELIVERY_ATTEMPTS: u32 = 3;
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(50);

/// Consume signals until the queue closes or `cancel` fires. Signals for the
/// same run are handled one at a time; different runs proceed concurrently.
pub async fn finalize_task(
    finalizer: Arc<Finalizer>,
    mut rx: mpsc::Receiver<JobFinished>,
    cancel: CancellationToken,
) {
    log::info!("Finalize task started");
    let lanes: Lanes = Arc::new(Mutex::new(HashMap::new()));
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Finalize task cancelled");
                break;
            }
            signal = rx.recv() => {
                match signal {
                    Some(signal) => {
                        let finalizer = finalizer.clone();
                        let lanes = lanes.clone();
                        in_flight.spawn(async move {
                            handle_in_lane(&finalizer, &lanes, signal).await;
                        });
                        while in_flight.try_join_next().is_some() {}
                    }
                    None => {
                        log::info!("Finalize task channel closed");
                        break;
                    }
                }
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    log::info!("Finalize task stopped");
}

async fn handle_in_lane(finalizer: &Finalizer, lanes: &Lanes, signal: JobFinished) {
    let key = signal.run_id.clone().unwrap_or_default();
    let lane = {
        let mut map = lanes.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(key.clone()).or_default().clone()
    };

    {
        let _turn = lane.lock().await;
        // A failed step leaves the job pending, so handing the same signal
        // back is safe.
        for attempt in 1..=DELIVERY_ATTEMPTS {
            match finalizer.handle(&signal).await {
                Ok(_) => break,
                Err(e) if attempt < DELIVERY_ATTEMPTS => {
                    log::warn!(
                        "Accounting job {} of case {} failed (attempt {}/{}): {}",
                        signal.job_id,
                        signal.case_id,
                        attempt,
                        DELIVERY_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(REDELIVERY_BACKOFF * attempt).await;
                }
                Err(e) => log::error!(
                    "Failed to account job {} of case {}, leaving it to the run TTL: {}",
                    signal.job_id,
                    signal.case_id,
                    e
                ),
            }
        }
    }

    let mut map = lanes.lock().unwrap_or_else(|p| p.into_inner());
    if Arc::strong_count(&lane) == 2 {
        map.remove(&key);
    }
}

/// Fallback mode has no run state: signals are only logged, and the poller
/// detects completion from the persistent store.
pub async fn drain_untracked(mut rx: mpsc::Receiver<JobFinished>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = rx.recv() => {
                match signal {
                    Some(signal) => log::info!(
                        "{} case={} job={} outcome={}",
                        EVENT_JOB_FINISHED,
                        signal.case_id,
                        signal.job_id,
                        signal.outcome
                    ),
                    None => break,
                }
            }
        }
    }
}
