// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Minimal wire surface against the local inference runtime.
//!
//! Only the endpoints needed to manage artifacts are implemented:
//! `GET /api/tags` for presence checks and `POST /api/pull` for the
//! line-delimited progress stream. Inference is somebody else's job.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::errors::PullError;
use crate::pull::CancelFlag;

/// Default runtime endpoint.
pub const DEFAULT_RUNTIME_URL: &str = "http://127.0.0.1:11434";

/// Timeout for connection checks and tag listings (in seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Timeout for model pull operations (in seconds). Models are large.
const PULL_TIMEOUT_SECS: u64 = 3600;

/// The `status` value that marks a pull stream as complete.
pub const PULL_SUCCESS_MARKER: &str = "success";

/// Errors specific to runtime API calls.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// Runtime server is not running or unreachable.
    NotRunning(String),
    /// Connection timed out.
    Timeout(String),
    /// The requested model was not found in the registry.
    ModelNotFound(String),
    /// API error from the runtime.
    ApiError(String),
    /// Network or HTTP error.
    NetworkError(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning(msg) => write!(f, "Runtime is not running: {}", msg),
            Self::Timeout(msg) => write!(f, "Request timed out: {}", msg),
            Self::ModelNotFound(model) => write!(f, "Model not found: {}", model),
            Self::ApiError(msg) => write!(f, "Runtime API error: {}", msg),
            Self::NetworkError(msg) => write!(f, "Network error: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// One line of the `/api/pull` NDJSON progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullLine {
    /// Current status message.
    pub status: String,
    /// Digest of the layer being downloaded (if applicable).
    pub digest: Option<String>,
    /// Total size in bytes (absent during manifest resolution).
    pub total: Option<u64>,
    /// Completed size in bytes (absent during manifest resolution).
    pub completed: Option<u64>,
}

impl PullLine {
    /// Download progress as a percentage, clamped to [0, 100].
    ///
    /// `None` while byte counts are unknown (manifest phase) — callers
    /// should report an indeterminate state, not invent a number.
    pub fn percentage(&self) -> Option<f64> {
        match (self.total, self.completed) {
            (Some(total), Some(completed)) if total > 0 => {
                Some(((completed as f64 / total as f64) * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        }
    }

    /// Whether this line is the stream's success marker.
    pub fn is_success(&self) -> bool {
        self.status == PULL_SUCCESS_MARKER
    }
}

/// How a pull stream ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStreamEnd {
    /// The success marker arrived.
    Success,
    /// The cancel flag was raised; the local read loop stopped.
    Cancelled,
}

/// Model information returned from the tags endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name.
    pub name: String,
    /// Model size in bytes.
    pub size: u64,
    /// Model digest.
    pub digest: String,
    /// Model modification time.
    pub modified_at: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    digest: String,
    #[serde(default)]
    modified_at: String,
}

/// Client for the runtime's model-management API.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    /// Base URL for the runtime API.
    base_url: String,
    /// HTTP client with configured timeouts.
    client: reqwest::Client,
    /// Timeout for pull operations.
    pull_timeout: Duration,
}

impl Default for RuntimeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeClient {
    /// Create a client against the default runtime URL.
    pub fn new() -> Self {
        Self::with_url(DEFAULT_RUNTIME_URL)
    }

    /// Create a client against a custom URL.
    pub fn with_url(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: url.into().trim_end_matches('/').to_string(),
            client,
            pull_timeout: Duration::from_secs(PULL_TIMEOUT_SECS),
        }
    }

    /// Set a custom timeout for pull operations.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Get the base URL of the client.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the runtime is up and answering API requests.
    pub async fn check_running(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// List the names of all locally available models.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        Ok(self.list_models_detailed().await?.into_iter().map(|m| m.name).collect())
    }

    /// List all locally available models with details.
    pub async fn list_models_detailed(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    anyhow!(RuntimeError::NotRunning(format!(
                        "Cannot connect to runtime at {}",
                        self.base_url
                    )))
                } else if e.is_timeout() {
                    anyhow!(RuntimeError::Timeout(
                        "Connection timed out while listing models".to_string()
                    ))
                } else {
                    anyhow!(RuntimeError::NetworkError(e.to_string()))
                }
            })?;

        if !response.status().is_success() {
            return Err(anyhow!(RuntimeError::ApiError(format!(
                "Failed to list models: HTTP {}",
                response.status()
            ))));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .context("Failed to parse model list response")?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size: m.size,
                digest: m.digest,
                modified_at: m.modified_at,
            })
            .collect())
    }

    /// Check if a specific model is available locally.
    ///
    /// A bare name matches any tag of that model ("qwen2.5" matches
    /// "qwen2.5:0.5b").
    pub async fn has_model(&self, model: &str) -> Result<bool> {
        let models = self.list_models().await?;
        Ok(models
            .iter()
            .any(|m| m == model || m.starts_with(&format!("{}:", model))))
    }

    /// Issue a streaming pull for a named model.
    ///
    /// Each well-formed NDJSON line is handed to `on_line` in stream
    /// order. Malformed lines are logged and skipped. The cancel flag
    /// is checked between chunks; raising it stops the local read loop
    /// without rolling back whatever the runtime already stored.
    ///
    /// Ends `Ok(Success)` only if the success marker was observed.
    /// A stream that ends without it is a `PullError::StreamInterrupted`
    /// carrying the last observed status message.
    pub async fn pull_stream<F>(
        &self,
        name: &str,
        cancel: &CancelFlag,
        mut on_line: F,
    ) -> Result<PullStreamEnd>
    where
        F: FnMut(&PullLine),
    {
        let url = format!("{}/api/pull", self.base_url);
        let request_body = serde_json::json!({
            "name": name,
            "stream": true
        });

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .timeout(self.pull_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    anyhow!(PullError::RuntimeUnreachable(format!(
                        "Cannot connect to runtime at {}",
                        self.base_url
                    )))
                } else if e.is_timeout() {
                    anyhow!(RuntimeError::Timeout(
                        "Pull operation timed out. The model may be very large.".to_string()
                    ))
                } else {
                    anyhow!(RuntimeError::NetworkError(e.to_string()))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 || error_text.contains("not found") {
                return Err(anyhow!(RuntimeError::ModelNotFound(name.to_string())));
            }
            return Err(anyhow!(PullError::ApiError(format!(
                "Failed to pull model: HTTP {} - {}",
                status, error_text
            ))));
        }

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut saw_success = false;
        let mut last_status: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(PullStreamEnd::Cancelled);
            }

            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    // Cancellation often surfaces as a dropped stream.
                    if cancel.is_cancelled() {
                        return Ok(PullStreamEnd::Cancelled);
                    }
                    let message = last_status.unwrap_or_else(|| format!("stream error: {}", e));
                    return Err(anyhow!(PullError::StreamInterrupted(message)));
                }
                None => break,
            };

            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(parsed) = parse_progress_line(&line) {
                    last_status = Some(parsed.status.clone());
                    if parsed.is_success() {
                        saw_success = true;
                    }
                    on_line(&parsed);
                }
            }
        }

        // Servers may omit the trailing newline on the final line.
        if !buf.is_empty() {
            if let Some(parsed) = parse_progress_line(&buf) {
                last_status = Some(parsed.status.clone());
                if parsed.is_success() {
                    saw_success = true;
                }
                on_line(&parsed);
            }
        }

        if saw_success {
            Ok(PullStreamEnd::Success)
        } else if cancel.is_cancelled() {
            Ok(PullStreamEnd::Cancelled)
        } else {
            let message = last_status.unwrap_or_else(|| "stream ended before success".to_string());
            Err(anyhow!(PullError::StreamInterrupted(message)))
        }
    }
}

/// Parse one NDJSON line, tolerating garbage.
///
/// Malformed lines are logged and skipped, never fatal to the job.
fn parse_progress_line(raw: &[u8]) -> Option<PullLine> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<PullLine>(text) {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::debug!("Skipping malformed progress line: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_clamped() {
        let line = PullLine {
            status: "downloading".to_string(),
            digest: Some("sha256:abc123".to_string()),
            total: Some(1000),
            completed: Some(500),
        };
        assert_eq!(line.percentage(), Some(50.0));

        let overrun = PullLine {
            status: "downloading".to_string(),
            digest: None,
            total: Some(1000),
            completed: Some(1500),
        };
        assert_eq!(overrun.percentage(), Some(100.0));
    }

    #[test]
    fn test_percentage_indeterminate_without_totals() {
        let line = PullLine {
            status: "pulling manifest".to_string(),
            digest: None,
            total: None,
            completed: None,
        };
        assert_eq!(line.percentage(), None);

        let zero_total = PullLine {
            status: "downloading".to_string(),
            digest: None,
            total: Some(0),
            completed: Some(0),
        };
        assert_eq!(zero_total.percentage(), None);
    }

    #[test]
    fn test_success_marker() {
        let line = PullLine {
            status: "success".to_string(),
            digest: None,
            total: None,
            completed: None,
        };
        assert!(line.is_success());
    }

    #[test]
    fn test_parse_progress_line_skips_garbage() {
        assert!(parse_progress_line(b"not json at all\n").is_none());
        assert!(parse_progress_line(b"   \n").is_none());

        let parsed = parse_progress_line(br#"{"status":"downloading","total":10,"completed":5}"#);
        let parsed = parsed.unwrap();
        assert_eq!(parsed.status, "downloading");
        assert_eq!(parsed.completed, Some(5));
    }

    #[test]
    fn test_url_normalization() {
        let client = RuntimeClient::with_url("http://localhost:11434/");
        assert_eq!(client.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::NotRunning("test".to_string());
        assert!(err.to_string().contains("not running"));

        let err = RuntimeError::ModelNotFound("llama3".to_string());
        assert!(err.to_string().contains("llama3"));
    }
}
