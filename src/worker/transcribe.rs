use crate::coordination::{job_lock_key, LockManager, ReleaseOutcome};
use crate::database::Database;
use crate::provider::{ProviderError, TranscriptionProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::events::{JobFinished, JobOutcome, TranscribeTask};

/// Processes a single task under its per-job lock.
pub struct JobWorker {
    db: Arc<Database>,
    locks: Arc<dyn LockManager>,
    provider: Arc<dyn TranscriptionProvider>,
    job_lock_ttl: Duration,
    provider_timeout: Duration,
}

/// Why a job stopped short of success.
enum JobError {
    Cancelled,
    Failed(String),
}

impl From<ProviderError> for JobError {
    fn from(e: ProviderError) -> Self {
        JobError::Failed(e.to_string())
    }
}

impl JobWorker {
    pub fn new(
        db: Arc<Database>,
        locks: Arc<dyn LockManager>,
        provider: Arc<dyn TranscriptionProvider>,
        job_lock_ttl: Duration,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            db,
            locks,
            provider,
            job_lock_ttl,
            provider_timeout,
        }
    }

    /// Run one task and produce its `job.finished` signal.
    ///
    /// Returns `None` only when `cancel` fires mid-job; the process is going
    /// away and the run is left to expire.
    pub async fn process(
        &self,
        task: &TranscribeTask,
        cancel: &CancellationToken,
    ) -> Option<JobFinished> {
        let key = job_lock_key(task.job_id);
        let grant = match self.locks.acquire(&key, self.job_lock_ttl).await {
            Ok(grant) => grant,
            Err(e) => {
                log::error!("Job {} (case {}): lock backend failed: {}", task.job_id, task.case_id, e);
                return Some(JobFinished::for_task(
                    task,
                    JobOutcome::Failed,
                    Some(format!("job lock unavailable: {}", e)),
                ));
            }
        };
        if !grant.acquired {
            log::info!(
                "Job {} (case {}) is held by another worker, reporting cached",
                task.job_id,
                task.case_id
            );
            return Some(JobFinished::for_task(task, JobOutcome::Cached, None));
        }

        let result = self.run_locked(task, cancel).await;

        if grant.enabled {
            match self.locks.release(&key, &grant.token).await {
                Ok(ReleaseOutcome::Released) => {}
                Ok(ReleaseOutcome::Stale) => log::warn!(
                    "Job {} lock expired before release (ttl {:?})",
                    task.job_id,
                    self.job_lock_ttl
                ),
                Err(e) => log::warn!("Failed to release job {} lock: {}", task.job_id, e),
            }
        }

        match result {
            Ok(outcome) => Some(JobFinished::for_task(task, outcome, None)),
            Err(JobError::Cancelled) => {
                log::info!("Job {} (case {}) cancelled", task.job_id, task.case_id);
                None
            }
            Err(JobError::Failed(message)) => {
                log::error!(
                    "Job {} (case {}) failed: {}",
                    task.job_id,
                    task.case_id,
                    message
                );
                self.mark_failed(task.job_id, &message);
                Some(JobFinished::for_task(task, JobOutcome::Failed, Some(message)))
            }
        }
    }

    /// Persist a failure without letting a storage error mask the original.
    pub fn mark_failed(&self, job_id: i64, message: &str) {
        if let Err(e) = self.db.mark_recording_failed(job_id, message) {
            log::warn!("Failed to mark recording {} failed: {}", job_id, e);
        }
    }

    async fn run_locked(
        &self,
        task: &TranscribeTask,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let done = self
            .db
            .is_recording_transcribed(task.job_id)
            .map_err(|e| JobError::Failed(e.to_string()))?;
        if done {
            log::info!("Recording {} already transcribed, reporting cached", task.job_id);
            return Ok(JobOutcome::Cached);
        }

        if let Err(e) = self.db.mark_recording_processing(task.job_id) {
            log::warn!("Failed to mark recording {} processing: {}", task.job_id, e);
        }

        log::info!(
            "Transcribing recording {} ({}/{}) for case {}",
            task.job_id,
            task.position + 1,
            task.total,
            task.case_id
        );
        let start = std::time::Instant::now();

        let call = tokio::time::timeout(
            self.provider_timeout,
            self.provider.transcribe(&task.recording_ref),
        );
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
            result = call => result,
        };
        let transcript = match result {
            Ok(inner) => inner?,
            Err(_) => return Err(ProviderError::Timeout(self.provider_timeout).into()),
        };

        self.db
            .save_transcript(task.case_id, task.job_id, &transcript)
            .map_err(|e| JobError::Failed(format!("failed to persist transcript: {}", e)))?;

        log::info!(
            "Recording {} transcribed in {:.1}s",
            task.job_id,
            start.elapsed().as_secs_f64()
        );
        Ok(JobOutcome::Ok)
    }
}
