//! Completion detection without shared run state.
//!
//! Re-reads the persistent store at a fixed interval until every dispatched
//! recording is resolved (transcribed or failed) or the wait bound elapses.
//! Without a finalize-once flag, two replicas can both observe completion and
//! both emit `case.transcribed`.

use crate::coordination::{case_lock_key, LockGrant, LockManager};
use crate::database::Database;
use crate::error::AppResult;
use crate::notify::{
    notify_best_effort, CompletionBus, Notifier, EVENT_CASE_PROGRESS, EVENT_CASE_TRANSCRIBED,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::events::{CaseProgressEvent, CaseTranscribed};

pub struct FallbackPoller {
    db: Arc<Database>,
    locks: Arc<dyn LockManager>,
    notifier: Arc<dyn Notifier>,
    bus: CompletionBus,
    interval: Duration,
    timeout: Duration,
}

impl FallbackPoller {
    pub fn new(
        db: Arc<Database>,
        locks: Arc<dyn LockManager>,
        notifier: Arc<dyn Notifier>,
        bus: CompletionBus,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            locks,
            notifier,
            bus,
            interval,
            timeout,
        }
    }

    /// Poll until `job_ids` are all resolved. Returns `None` on timeout, in
    /// which case the case lock is left to expire.
    pub async fn watch(
        &self,
        case_id: i64,
        job_ids: Vec<i64>,
        grant: LockGrant,
    ) -> AppResult<Option<CaseTranscribed>> {
        let started = Instant::now();
        let target = job_ids.len() as i64;
        let mut last_seen: Option<(i64, i64)> = None;

        loop {
            let (transcribed, failed) = self.db.count_resolved(&job_ids)?;
            let processed = transcribed + failed;

            if processed >= target {
                let total_recordings = self.db.case_progress(case_id)?.total;
                let signal = CaseTranscribed {
                    case_id,
                    run_id: None,
                    total_recordings,
                    newly_transcribed: transcribed,
                    cached_count: 0,
                    failed_count: failed,
                    duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
                    failed_jobs: Vec::new(),
                };
                self.finish(&signal, &grant).await;
                return Ok(Some(signal));
            }

            if last_seen != Some((transcribed, failed)) {
                last_seen = Some((transcribed, failed));
                let progress = CaseProgressEvent {
                    case_id,
                    run_id: None,
                    processed,
                    target,
                    pending: target - processed,
                };
                if let Ok(payload) = serde_json::to_value(&progress) {
                    notify_best_effort(self.notifier.as_ref(), EVENT_CASE_PROGRESS, payload).await;
                }
            }

            if started.elapsed() >= self.timeout {
                log::warn!(
                    "Case {}: {} of {} recordings resolved after {:?}, giving up",
                    case_id,
                    processed,
                    target,
                    self.timeout
                );
                return Ok(None);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn finish(&self, signal: &CaseTranscribed, grant: &LockGrant) {
        log::info!(
            "Case {} resolved by polling: {} transcribed, {} failed",
            signal.case_id,
            signal.newly_transcribed,
            signal.failed_count
        );
        if let Err(e) = self.db.mark_case_finished(signal.case_id) {
            log::warn!("Case {}: failed to record finish: {}", signal.case_id, e);
        }
        if let Ok(payload) = serde_json::to_value(signal) {
            notify_best_effort(self.notifier.as_ref(), EVENT_CASE_TRANSCRIBED, payload).await;
        }
        if grant.enabled {
            if let Err(e) = self
                .locks
                .release(&case_lock_key(signal.case_id), &grant.token)
                .await
            {
                log::warn!("Case {}: failed to release lock: {}", signal.case_id, e);
            }
        }
        self.bus.publish(signal.clone());
    }
}
