//! Signals exchanged between the dispatcher, the workers and the finalizer.

use crate::coordination::FailedJob;
use serde::{Deserialize, Serialize};

pub const EVENT_JOB_TRANSCRIBE: &str = "job.transcribe";
pub const EVENT_JOB_FINISHED: &str = "job.finished";

/// One pending recording handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribeTask {
    /// `None` in fallback mode, where no run state is kept.
    pub run_id: Option<String>,
    pub case_id: i64,
    pub job_id: i64,
    pub recording_ref: String,
    pub position: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Ok,
    /// Already transcribed, or another worker holds the job.
    Cached,
    Failed,
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Ok => write!(f, "ok"),
            JobOutcome::Cached => write!(f, "cached"),
            JobOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Emitted exactly once per dispatched task. Delivery may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFinished {
    pub run_id: Option<String>,
    pub case_id: i64,
    pub job_id: i64,
    pub outcome: JobOutcome,
    pub error: Option<String>,
}

impl JobFinished {
    pub fn for_task(task: &TranscribeTask, outcome: JobOutcome, error: Option<String>) -> Self {
        Self {
            run_id: task.run_id.clone(),
            case_id: task.case_id,
            job_id: task.job_id,
            outcome,
            error,
        }
    }
}

/// Terminal `case.transcribed` signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseTranscribed {
    pub case_id: i64,
    pub run_id: Option<String>,
    pub total_recordings: i64,
    pub newly_transcribed: i64,
    pub cached_count: i64,
    pub failed_count: i64,
    pub duration_ms: i64,
    pub failed_jobs: Vec<FailedJob>,
}

impl CaseTranscribed {
    /// Terminal signal for a case with nothing left to do.
    pub fn nothing_pending(case_id: i64, total_recordings: i64) -> Self {
        Self {
            case_id,
            run_id: None,
            total_recordings,
            newly_transcribed: 0,
            cached_count: 0,
            failed_count: 0,
            duration_ms: 0,
            failed_jobs: Vec::new(),
        }
    }
}

/// Throttled `case.progress` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseProgressEvent {
    pub case_id: i64,
    pub run_id: Option<String>,
    pub processed: i64,
    pub target: i64,
    pub pending: i64,
}
