//! Per-run shared state: metadata, pending set, failed set and counters.
//!
//! Every record carries a TTL that is refreshed on mutation, so an active run
//! never expires mid-flight while an abandoned one eventually disappears.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Immutable facts about one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub case_id: i64,
    pub total_recordings: i64,
    pub already_transcribed: i64,
    /// Jobs dispatched in this run.
    pub target: i64,
    /// Token holding the case-level lock; empty when locks are disabled.
    pub lock_token: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: i64,
    pub cached: i64,
    pub failed: i64,
}

impl RunCounters {
    pub fn newly_transcribed(&self) -> i64 {
        self.processed - self.cached - self.failed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub processed: i64,
    pub cached: i64,
    pub failed: i64,
}

/// Run state right after one job was accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accounted {
    pub counters: RunCounters,
    /// Jobs still pending, this one excluded.
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job_id: i64,
    pub error: String,
}

#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Write metadata and the pending set together.
    async fn create_run(&self, meta: &RunMeta, job_ids: &[i64]) -> AppResult<()>;

    /// Account one finished job as a single atomic step: remove `job_id` from
    /// the pending set, record `error` in the failed set, apply `delta` and
    /// refresh the run TTL. Returns `None` without changing anything when the
    /// job is no longer pending (duplicate or late signal) or the run is gone.
    /// A failed call leaves the job pending so a redelivered signal counts it.
    async fn account_job(
        &self,
        run_id: &str,
        job_id: i64,
        delta: CounterDelta,
        error: Option<&str>,
    ) -> AppResult<Option<Accounted>>;

    async fn read_pending_count(&self, run_id: &str) -> AppResult<usize>;

    async fn read_meta(&self, run_id: &str) -> AppResult<Option<RunMeta>>;

    async fn read_counters(&self, run_id: &str) -> AppResult<RunCounters>;

    async fn read_failed(&self, run_id: &str) -> AppResult<Vec<FailedJob>>;

    /// Set the finalized flag if absent. Exactly one caller ever sees `true`
    /// for a run while the flag lives, even after the run state is deleted.
    async fn finalize_once(&self, run_id: &str) -> AppResult<bool>;

    async fn delete_run(&self, run_id: &str) -> AppResult<()>;

    /// Drop expired runs and finalize flags. Returns how many were removed.
    async fn purge_expired(&self) -> AppResult<usize>;
}

struct RunRecord {
    meta: RunMeta,
    pending: BTreeSet<i64>,
    failed: BTreeMap<i64, String>,
    counters: RunCounters,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<String, RunRecord>,
    finalized: HashMap<String, Instant>,
}

impl MemoryState {
    /// Live record for `run_id`, evicting it first if expired.
    fn live(&mut self, run_id: &str) -> Option<&mut RunRecord> {
        let now = Instant::now();
        if self
            .runs
            .get(run_id)
            .is_some_and(|record| record.expires_at <= now)
        {
            self.runs.remove(run_id);
        }
        self.runs.get_mut(run_id)
    }
}

/// In-memory run-state store (single process).
#[derive(Clone)]
pub struct MemoryRunStateStore {
    state: Arc<Mutex<MemoryState>>,
    run_ttl: Duration,
    finalize_ttl: Duration,
}

impl MemoryRunStateStore {
    pub fn new(run_ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            run_ttl,
            finalize_ttl: run_ttl,
        }
    }

    fn expiry(&self, ttl: Duration) -> AppResult<Instant> {
        Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| AppError::Coordination("run ttl too large".to_string()))
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn create_run(&self, meta: &RunMeta, job_ids: &[i64]) -> AppResult<()> {
        let expires_at = self.expiry(self.run_ttl)?;
        let mut state = self.state.lock().await;
        if state.live(&meta.run_id).is_some() {
            return Err(AppError::Coordination(format!(
                "run {} already exists",
                meta.run_id
            )));
        }
        state.runs.insert(
            meta.run_id.clone(),
            RunRecord {
                meta: meta.clone(),
                pending: job_ids.iter().copied().collect(),
                failed: BTreeMap::new(),
                counters: RunCounters::default(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn account_job(
        &self,
        run_id: &str,
        job_id: i64,
        delta: CounterDelta,
        error: Option<&str>,
    ) -> AppResult<Option<Accounted>> {
        let expires_at = self.expiry(self.run_ttl)?;
        let mut state = self.state.lock().await;
        let Some(record) = state.live(run_id) else {
            return Ok(None);
        };
        if !record.pending.remove(&job_id) {
            return Ok(None);
        }
        if let Some(error) = error {
            record.failed.insert(job_id, error.to_string());
        }
        record.counters.processed += delta.processed;
        record.counters.cached += delta.cached;
        record.counters.failed += delta.failed;
        record.expires_at = expires_at;
        Ok(Some(Accounted {
            counters: record.counters,
            pending: record.pending.len(),
        }))
    }

    async fn read_pending_count(&self, run_id: &str) -> AppResult<usize> {
        let mut state = self.state.lock().await;
        Ok(state.live(run_id).map(|r| r.pending.len()).unwrap_or(0))
    }

    async fn read_meta(&self, run_id: &str) -> AppResult<Option<RunMeta>> {
        let mut state = self.state.lock().await;
        Ok(state.live(run_id).map(|r| r.meta.clone()))
    }

    async fn read_counters(&self, run_id: &str) -> AppResult<RunCounters> {
        let mut state = self.state.lock().await;
        Ok(state.live(run_id).map(|r| r.counters).unwrap_or_default())
    }

    async fn read_failed(&self, run_id: &str) -> AppResult<Vec<FailedJob>> {
        let mut state = self.state.lock().await;
        Ok(state
            .live(run_id)
            .map(|r| {
                r.failed
                    .iter()
                    .map(|(job_id, error)| FailedJob {
                        job_id: *job_id,
                        error: error.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn finalize_once(&self, run_id: &str) -> AppResult<bool> {
        let expires_at = self.expiry(self.finalize_ttl)?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.finalized.get(run_id) {
            Some(flag) if *flag > now => Ok(false),
            _ => {
                state.finalized.insert(run_id.to_string(), expires_at);
                Ok(true)
            }
        }
    }

    async fn delete_run(&self, run_id: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.runs.remove(run_id);
        Ok(())
    }

    async fn purge_expired(&self) -> AppResult<usize> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let before = state.runs.len() + state.finalized.len();
        state.runs.retain(|_, record| record.expires_at > now);
        state.finalized.retain(|_, flag| *flag > now);
        Ok(before - state.runs.len() - state.finalized.len())
    }
}
