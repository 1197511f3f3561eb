pub mod dispatch;
pub mod events;
pub mod finalize;
pub mod poll;
pub mod sweep;
pub mod transcribe;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use events::{JobFinished, JobOutcome, TranscribeTask};
use transcribe::JobWorker;

/// A job admitted to this process's pool
#[derive(Debug, Clone, Serialize)]
pub struct JobSlot {
    pub case_id: i64,
    pub job_id: i64,
    pub run_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Shared pool state for status reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolState {
    pub slots: Vec<JobSlot>,
    pub completed: u64,
    pub cached: u64,
    pub failed: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl PoolState {
    pub fn is_processing(&self) -> bool {
        !self.slots.is_empty()
    }

    fn record(&mut self, outcome: Option<JobOutcome>) {
        match outcome {
            Some(JobOutcome::Ok) => self.completed += 1,
            Some(JobOutcome::Cached) => self.cached += 1,
            Some(JobOutcome::Failed) => self.failed += 1,
            None => {}
        }
        self.last_activity = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_concurrency: usize,
    pub per_case_concurrency: usize,
}

/// Runs transcription tasks concurrently, bounded globally and per case.
#[derive(Clone)]
pub struct WorkerPool {
    worker: Arc<JobWorker>,
    state: Arc<RwLock<PoolState>>,
    global: Arc<Semaphore>,
    per_case: Arc<Mutex<HashMap<i64, Arc<Semaphore>>>>,
    per_case_limit: usize,
}

impl WorkerPool {
    pub fn new(worker: Arc<JobWorker>, state: Arc<RwLock<PoolState>>, limits: PoolLimits) -> Self {
        Self {
            worker,
            state,
            global: Arc::new(Semaphore::new(limits.max_concurrency.max(1))),
            per_case: Arc::new(Mutex::new(HashMap::new())),
            per_case_limit: limits.per_case_concurrency.max(1),
        }
    }

    /// Consume tasks until the queue closes or `cancel` fires, then wait for
    /// admitted jobs to wind down.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<TranscribeTask>,
        finished_tx: mpsc::Sender<JobFinished>,
        cancel: CancellationToken,
    ) {
        log::info!(
            "Worker pool started (global {}, per case {})",
            self.global.available_permits(),
            self.per_case_limit
        );
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Worker pool cancelled");
                    break;
                }
                task = rx.recv() => {
                    match task {
                        Some(task) => {
                            let pool = self.clone();
                            let finished_tx = finished_tx.clone();
                            let cancel = cancel.clone();
                            in_flight.spawn(async move {
                                pool.run_job(task, finished_tx, cancel).await;
                            });
                            while in_flight.try_join_next().is_some() {}
                        }
                        None => {
                            log::info!("Task queue closed");
                            break;
                        }
                    }
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        log::info!("Worker pool stopped");
    }

    async fn run_job(
        &self,
        task: TranscribeTask,
        finished_tx: mpsc::Sender<JobFinished>,
        cancel: CancellationToken,
    ) {
        // Case permit first so a case waiting on its own limit never sits on
        // a global permit.
        let case_sem = self.case_semaphore(task.case_id);
        let Some(case_permit) = acquire_or_cancel(case_sem.clone(), &cancel).await else {
            return;
        };
        let Some(global_permit) = acquire_or_cancel(self.global.clone(), &cancel).await else {
            return;
        };

        self.enter_slot(&task).await;

        let worker = self.worker.clone();
        let job = task.clone();
        let job_cancel = cancel.clone();
        let handle = tokio::spawn(async move { worker.process(&job, &job_cancel).await });

        let signal = match handle.await {
            Ok(signal) => signal,
            Err(e) => {
                let message = format!("worker panicked: {}", e);
                log::error!("Job {} (case {}): {}", task.job_id, task.case_id, message);
                self.worker.mark_failed(task.job_id, &message);
                Some(JobFinished::for_task(&task, JobOutcome::Failed, Some(message)))
            }
        };

        self.leave_slot(&task, signal.as_ref().map(|s| s.outcome)).await;
        drop(global_permit);
        drop(case_permit);
        self.release_case_semaphore(task.case_id, case_sem);

        if let Some(signal) = signal {
            if finished_tx.send(signal).await.is_err() {
                log::warn!("Finalizer queue closed, dropping signal for job {}", task.job_id);
            }
        }
    }

    fn case_semaphore(&self, case_id: i64) -> Arc<Semaphore> {
        let mut map = self.per_case.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(case_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_case_limit)))
            .clone()
    }

    fn release_case_semaphore(&self, case_id: i64, sem: Arc<Semaphore>) {
        let mut map = self.per_case.lock().unwrap_or_else(|p| p.into_inner());
        // Only the map and this handle left: nobody else is waiting on it.
        if Arc::strong_count(&sem) == 2 {
            map.remove(&case_id);
        }
    }

    async fn enter_slot(&self, task: &TranscribeTask) {
        let mut ws = self.state.write().await;
        ws.slots.push(JobSlot {
            case_id: task.case_id,
            job_id: task.job_id,
            run_id: task.run_id.clone(),
            started_at: Utc::now(),
        });
        ws.last_activity = Some(Utc::now());
    }

    async fn leave_slot(&self, task: &TranscribeTask, outcome: Option<JobOutcome>) {
        let mut ws = self.state.write().await;
        if let Some(idx) = ws
            .slots
            .iter()
            .position(|s| s.job_id == task.job_id && s.run_id == task.run_id)
        {
            ws.slots.remove(idx);
        }
        ws.record(outcome);
    }
}

async fn acquire_or_cancel(
    sem: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        permit = sem.acquire_owned() => permit.ok(),
    }
}
