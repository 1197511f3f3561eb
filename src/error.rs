use thiserror::Error;

/// Typed error hierarchy for the coordination layer.
///
/// Lock contention is deliberately absent: a busy lock is a normal
/// `LockGrant { acquired: false, .. }`, not an error. Only backend failures,
/// storage failures and fatal configuration problems travel through here.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    /// Fatal and non-retryable (missing credentials, invalid settings).
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    /// The lock or run-state backend failed (not merely "busy").
    #[error("Coordination backend error: {0}")]
    Coordination(String),

    #[error("Queue closed: {0}")]
    QueueClosed(String),

    #[error("{0}")]
    Other(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Errors that must abort a dispatch before any lock is taken.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Config(_))
    }
}

/// Serialize as a plain string so callers receive a flat error message.
impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<crate::provider::ProviderError> for AppError {
    fn from(e: crate::provider::ProviderError) -> Self {
        if e.is_fatal() {
            AppError::Config(e.to_string())
        } else {
            AppError::Provider(e.to_string())
        }
    }
}

/// Allows `.ok_or_else(|| format!(…))?` to coerce into AppError.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

/// Allows `.ok_or("literal string")?` to coerce into AppError.
impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}
