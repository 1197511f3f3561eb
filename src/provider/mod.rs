//! Transcription provider seam and the hosted speech-to-text client.
//!
//! The client posts a recording URL to the provider and parses the transcript
//! out of the JSON response. It never downloads audio itself.

use crate::config::ProviderConfig;
use crate::database::TranscriptResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Fatal: nothing can be transcribed until configuration changes.
    #[error("missing provider credentials: {0}")]
    MissingCredentials(String),

    #[error("recording source unavailable: {0}")]
    MissingSource(String),

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::MissingCredentials(_))
    }
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Verify prerequisites (credentials) before any work is dispatched.
    fn check_ready(&self) -> Result<(), ProviderError>;

    async fn transcribe(&self, recording_ref: &str) -> Result<TranscriptResult, ProviderError>;
}

/// Client for a hosted speech-to-text API that accepts a remote audio URL.
pub struct HttpTranscriptionProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl HttpTranscriptionProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self::with_timeout(config, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(config: &ProviderConfig, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: config.model.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl TranscriptionProvider for HttpTranscriptionProvider {
    fn check_ready(&self) -> Result<(), ProviderError> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err(ProviderError::MissingCredentials(
                "provider.api_key / TRANSCRIBE_API_KEY is not set".to_string(),
            )),
        }
    }

    async fn transcribe(&self, recording_ref: &str) -> Result<TranscriptResult, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ProviderError::MissingCredentials("provider.api_key is not set".to_string())
        })?;
        if recording_ref.trim().is_empty() {
            return Err(ProviderError::MissingSource("empty recording reference".to_string()));
        }

        let url = format!("{}/v1/listen", self.base_url);
        log::info!(
            "Sending recording to transcription provider: model={}, source={}",
            self.model,
            recording_ref
        );

        let response = self
            .client
            .post(&url)
            .query(&[("model", self.model.as_str()), ("smart_format", "true")])
            .header("Authorization", format!("Token {}", api_key))
            .json(&ListenRequest { url: recording_ref })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::MissingCredentials(format!(
                "provider rejected credentials ({})",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::BAD_REQUEST {
                return Err(ProviderError::MissingSource(format!("{}: {}", status, body)));
            }
            return Err(ProviderError::Request(format!("provider returned {}: {}", status, body)));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let result = parse_listen_response(body, &self.model)?;
        log::info!(
            "Transcription received: {} chars, duration={:?}s",
            result.text.len(),
            result.duration_seconds
        );
        Ok(result)
    }
}

/// Pull transcript text and metadata out of a listen response.
fn parse_listen_response(
    body: serde_json::Value,
    requested_model: &str,
) -> Result<TranscriptResult, ProviderError> {
    let parsed: ListenResponse = serde_json::from_value(body.clone())
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

    let channel = parsed
        .results
        .channels
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("no channels in response".to_string()))?;
    let alternative = channel
        .alternatives
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("no alternatives in response".to_string()))?;

    let model_used = parsed
        .metadata
        .as_ref()
        .and_then(|m| m.model_info.as_ref())
        .and_then(|info| info.values().next())
        .map(|info| info.name.clone())
        .unwrap_or_else(|| requested_model.to_string());

    Ok(TranscriptResult {
        text: alternative.transcript,
        language: channel.detected_language,
        confidence: alternative.confidence,
        duration_seconds: parsed.metadata.as_ref().and_then(|m| m.duration),
        model_used: Some(model_used),
        metadata: body.get("metadata").cloned().unwrap_or(serde_json::Value::Null),
    })
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ListenRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListenResponse {
    #[serde(default)]
    metadata: Option<ListenMetadata>,
    results: ListenResults,
}

#[derive(Debug, Deserialize)]
struct ListenMetadata {
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    model_info: Option<std::collections::HashMap<String, ModelInfo>>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListenResults {
    channels: Vec<ListenChannel>,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    #[serde(default)]
    detected_language: Option<String>,
    alternatives: Vec<ListenAlternative>,
}

#[derive(Debug, Deserialize)]
struct ListenAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
}
