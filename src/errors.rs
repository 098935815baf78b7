// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for model acquisition and runtime supervision.
//!
//! Failures here are recorded in job state and surfaced to the immediate
//! caller; they never unwind past the orchestrator. A failed pull marks
//! one model unavailable, it does not take the host application down.

use std::fmt;

/// Errors from the resumable transfer engine.
///
/// The partial file on disk is always left in place, so a `Retryable`
/// error can be answered by simply calling `download` again.
#[derive(Debug, Clone)]
pub enum TransferError {
    /// Network failure, timeout, or a server-side status that is worth
    /// retrying. The next call resumes from the bytes already on disk.
    Retryable(String),
    /// Non-retryable failure (e.g. 404). Surfaced as-is.
    Fatal(String),
}

impl TransferError {
    /// Whether a caller may re-invoke the download and expect progress.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Retryable(_))
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable(msg) => write!(f, "transfer failed (retryable): {}", msg),
            Self::Fatal(msg) => write!(f, "transfer failed: {}", msg),
        }
    }
}

impl std::error::Error for TransferError {}

/// Errors from a streaming model pull against the runtime.
#[derive(Debug, Clone)]
pub enum PullError {
    /// The progress stream ended or errored before the success marker.
    /// Carries the last observed status message for diagnostics.
    StreamInterrupted(String),
    /// The runtime could not be reached at all.
    RuntimeUnreachable(String),
    /// The runtime answered with an error (unknown model, bad request).
    ApiError(String),
}

impl fmt::Display for PullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamInterrupted(msg) => write!(f, "pull stream interrupted: {}", msg),
            Self::RuntimeUnreachable(msg) => write!(f, "runtime unreachable: {}", msg),
            Self::ApiError(msg) => write!(f, "runtime API error: {}", msg),
        }
    }
}

impl std::error::Error for PullError {}

/// Errors from the runtime supervisor.
#[derive(Debug, Clone)]
pub enum SupervisorError {
    /// The runtime subprocess could not be spawned (binary missing,
    /// permission denied). Non-fatal to the host: readiness checks are
    /// skipped and provisioning waits for the runtime to appear by
    /// other means.
    LaunchFailed(String),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaunchFailed(msg) => write!(f, "failed to launch runtime: {}", msg),
        }
    }
}

impl std::error::Error for SupervisorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_classification() {
        let retryable = TransferError::Retryable("connection reset".to_string());
        assert!(retryable.is_retryable());
        assert!(retryable.to_string().contains("retryable"));

        let fatal = TransferError::Fatal("HTTP 404".to_string());
        assert!(!fatal.is_retryable());
        assert!(fatal.to_string().contains("404"));
    }

    #[test]
    fn test_pull_error_display() {
        let err = PullError::StreamInterrupted("pulling manifest".to_string());
        assert!(err.to_string().contains("pulling manifest"));

        let err = PullError::RuntimeUnreachable("connection refused".to_string());
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn test_supervisor_error_display() {
        let err = SupervisorError::LaunchFailed("No such file or directory".to_string());
        assert!(err.to_string().contains("launch"));
    }
}
