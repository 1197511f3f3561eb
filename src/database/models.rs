use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl Default for TranscriptionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TranscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for TranscriptionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => Self::Pending,
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Lifecycle of a case as recorded in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Pending,
    /// Every recording has a transcript.
    Transcribed,
    /// A run finished but some recordings failed.
    Incomplete,
}

impl std::fmt::Display for CaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Transcribed => write!(f, "transcribed"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

impl From<String> for CaseState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "transcribed" => Self::Transcribed,
            "incomplete" => Self::Incomplete,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: i64,
    pub title: String,
    pub status: CaseState,
    pub created_date: String,
    pub finished_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: i64,
    pub case_id: i64,
    pub position: i64,
    pub audio_url: String,
    pub is_transcribed: bool,
    pub transcription_status: TranscriptionStatus,
    pub transcription_error: Option<String>,
    pub transcribed_date: Option<String>,
}

/// What the dispatcher needs to know about one recording of a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecording {
    pub job_id: i64,
    pub audio_url: String,
    pub position: i64,
    pub already_done: bool,
}

/// Provider output persisted for a recording.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub text: String,
    pub language: Option<String>,
    pub confidence: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub model_used: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptData {
    pub recording_id: i64,
    pub full_text: String,
    pub language: Option<String>,
    pub model_used: Option<String>,
    pub created_date: String,
}

/// Direct read of a case's progress from the persistent store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseProgress {
    pub total: i64,
    pub transcribed: i64,
    pub failed: i64,
}

impl CaseProgress {
    pub fn pending(&self) -> i64 {
        (self.total - self.transcribed - self.failed).max(0)
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.transcribed >= self.total
    }
}
