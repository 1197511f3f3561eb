//! Coordinator configuration.
//!
//! Loaded from `config.yaml`, then overridden by a `.env` file next to it and
//! finally by the process environment.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PROVIDER_URL: &str = "https://api.deepgram.com";
const DEFAULT_PROVIDER_MODEL: &str = "nova-2";

/// Which shared backend holds locks and run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local maps. Correct for a single replica only.
    Memory,
    /// A SQLite file shared by every replica on the host.
    Sqlite,
    /// No shared store: locks are disabled and completion is detected by
    /// polling the persistent store.
    None,
}

impl std::str::FromStr for BackendKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "none" | "" => Ok(Self::None),
            other => Err(AppError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROVIDER_URL.to_string(),
            api_key: None,
            model: DEFAULT_PROVIDER_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub database_path: PathBuf,
    pub backend: BackendKind,
    pub coordination_path: Option<PathBuf>,
    pub run_timeout_ms: u64,
    pub lock_safety_margin_ms: u64,
    pub job_lock_ttl_ms: u64,
    pub wait_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
    pub progress_every: usize,
    pub max_concurrency: usize,
    pub per_case_concurrency: usize,
    pub provider_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub queue_capacity: usize,
    pub provider: ProviderConfig,
    pub notify_webhook_url: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("case-transcriber");
        Self {
            database_path: data_dir.join("cases.db"),
            backend: BackendKind::Sqlite,
            coordination_path: None,
            run_timeout_ms: 30 * 60 * 1000,
            lock_safety_margin_ms: 60 * 1000,
            job_lock_ttl_ms: 15 * 60 * 1000,
            wait_timeout_ms: None,
            poll_interval_ms: 5000,
            progress_every: 5,
            max_concurrency: 4,
            per_case_concurrency: 2,
            provider_timeout_ms: 10 * 60 * 1000,
            store_timeout_ms: 5000,
            sweep_interval_ms: 5 * 60 * 1000,
            queue_capacity: 256,
            provider: ProviderConfig::default(),
            notify_webhook_url: None,
        }
    }
}

impl CoordinatorConfig {
    /// Load from a YAML file, then apply `.env` and environment overrides.
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("failed to read {:?}: {}", path, e)))?;
        let mut config = Self::from_yaml_str(&content)?;

        let env_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_overrides(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| load_env_value(env_dir, key))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> AppResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply overrides from a key lookup (environment, `.env`, or a test map).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("TRANSCRIBE_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = lookup("TRANSCRIBE_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(path) = lookup("TRANSCRIBE_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(backend) = lookup("TRANSCRIBE_BACKEND") {
            self.backend = backend.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_concurrency == 0 || self.per_case_concurrency == 0 {
            return Err(AppError::Config("concurrency limits must be at least 1".to_string()));
        }
        if self.progress_every == 0 {
            return Err(AppError::Config("progress_every must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(AppError::Config("queue_capacity must be at least 1".to_string()));
        }
        let timeouts = [
            ("run_timeout_ms", self.run_timeout_ms),
            ("job_lock_ttl_ms", self.job_lock_ttl_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("provider_timeout_ms", self.provider_timeout_ms),
            ("store_timeout_ms", self.store_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.wait_timeout_ms == Some(0) {
            return Err(AppError::Config("wait_timeout_ms must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// The case lock outlives the run by a safety margin so a slow finalizer
    /// still owns it while cleaning up.
    pub fn case_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms + self.lock_safety_margin_ms)
    }

    pub fn job_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.job_lock_ttl_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.unwrap_or(self.run_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn coordination_path(&self) -> PathBuf {
        self.coordination_path.clone().unwrap_or_else(|| {
            self.database_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("coordination.db")
        })
    }
}

/// Load a value from the `.env` file in `dir` by key name
pub fn load_env_value(dir: &Path, key: &str) -> Option<String> {
    let env_path = dir.join(".env");
    let prefix = format!("{}=", key);
    if let Ok(content) = std::fs::read_to_string(&env_path) {
        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix(&prefix) {
                let value = rest.trim().trim_matches('"').trim_matches('\'');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
