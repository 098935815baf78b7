// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resumable byte-range downloader for large model artifacts.
//!
//! Artifacts are multi-gigabyte, networks are unreliable. The engine
//! keeps whatever bytes made it to disk and asks the server for the
//! rest with a `Range` header on the next call:
//!
//! - `206 Partial Content` — append the body at end-of-file.
//! - `200 OK` with a partial file present — the server ignored the
//!   Range request; truncate and write the full body from scratch.
//! - `416 Range Not Satisfiable` — the file is already complete.
//!
//! Success is determined by HTTP status and clean stream completion,
//! never by a declared content-length matching bytes read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::errors::TransferError;

/// Connect timeout for artifact downloads.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Terminal status of one download call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Bytes are still streaming onto disk.
    InProgress,
    /// The stream completed cleanly.
    Completed,
    /// The call failed; partial bytes remain on disk for resume.
    Failed,
    /// The server reported the requested range unsatisfiable, meaning
    /// the file on disk is already complete.
    RangeNotSatisfiable,
}

/// Observable state of a single download call.
///
/// Owned exclusively by the engine for the duration of one call and
/// handed to the progress callback by reference.
#[derive(Debug, Clone)]
pub struct TransferState {
    /// Where the artifact is being written.
    pub destination: PathBuf,
    /// Bytes that were already on disk when the call started.
    pub resume_offset: u64,
    /// Bytes written by this call so far.
    pub bytes_transferred: u64,
    /// Current status.
    pub status: TransferStatus,
}

impl TransferState {
    /// Total bytes on disk, counting the resumed prefix.
    ///
    /// After a 200 fallback the resumed prefix was discarded, so only
    /// this call's bytes count.
    pub fn bytes_on_disk(&self) -> u64 {
        self.resume_offset + self.bytes_transferred
    }
}

/// Byte-range-aware file downloader.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    client: reqwest::Client,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEngine {
    /// Create a new engine with default timeouts.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Download `url` to `dest`, resuming from any partial file.
    ///
    /// Returns the number of bytes written by this call. Zero is a
    /// valid success (the file was already complete).
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64, TransferError> {
        self.download_with_progress(url, dest, |_| true).await
    }

    /// Download with a progress callback.
    ///
    /// The callback is invoked after each chunk is flushed and may
    /// return `false` to stop the transfer cooperatively. An aborted
    /// transfer surfaces as a retryable error; the bytes written so
    /// far stay on disk and a later call resumes from them.
    pub async fn download_with_progress<F>(
        &self,
        url: &str,
        dest: &Path,
        mut on_progress: F,
    ) -> Result<u64, TransferError>
    where
        F: FnMut(&TransferState) -> bool,
    {
        let existing_size = match fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).await.map_err(|e| {
                        TransferError::Fatal(format!(
                            "failed to create directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                0
            }
        };

        let mut request = self.client.get(url);
        if existing_size > 0 {
            tracing::info!(
                "Found existing partial file ({} bytes), attempting resume: {}",
                existing_size,
                dest.display()
            );
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", existing_size));
        }

        let response = request.send().await.map_err(classify_request_error)?;

        let mut state = TransferState {
            destination: dest.to_path_buf(),
            resume_offset: existing_size,
            bytes_transferred: 0,
            status: TransferStatus::InProgress,
        };

        let status = response.status();
        let file = match status.as_u16() {
            206 => {
                tracing::info!("Server honors Range, appending remaining content");
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(dest)
                    .await
                    .map_err(|e| TransferError::Fatal(format!("failed to open {}: {}", dest.display(), e)))?
            }
            200 => {
                if existing_size > 0 {
                    tracing::warn!(
                        "Server ignored Range request, restarting {} from scratch",
                        dest.display()
                    );
                    state.resume_offset = 0;
                }
                // Truncates any partial content; full body follows.
                File::create(dest)
                    .await
                    .map_err(|e| TransferError::Fatal(format!("failed to create {}: {}", dest.display(), e)))?
            }
            416 => {
                tracing::info!("Download already complete (Range Not Satisfiable)");
                state.status = TransferStatus::RangeNotSatisfiable;
                on_progress(&state);
                return Ok(0);
            }
            code => {
                state.status = TransferStatus::Failed;
                let msg = format!("download failed with status {}", code);
                return Err(if status.is_server_error() || code == 429 {
                    TransferError::Retryable(msg)
                } else {
                    TransferError::Fatal(msg)
                });
            }
        };

        match self.stream_body(response, file, &mut state, &mut on_progress).await {
            Ok(()) => {
                state.status = TransferStatus::Completed;
                on_progress(&state);
                tracing::info!(
                    "Download finished: {} bytes written to {}",
                    state.bytes_transferred,
                    state.destination.display()
                );
                Ok(state.bytes_transferred)
            }
            Err(e) => {
                // Partial bytes stay on disk as the resume checkpoint.
                state.status = TransferStatus::Failed;
                on_progress(&state);
                Err(e)
            }
        }
    }

    async fn stream_body<F>(
        &self,
        response: reqwest::Response,
        mut file: File,
        state: &mut TransferState,
        on_progress: &mut F,
    ) -> Result<(), TransferError>
    where
        F: FnMut(&TransferState) -> bool,
    {
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| TransferError::Retryable(format!("stream error mid-transfer: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::Fatal(format!("write error: {}", e)))?;
            state.bytes_transferred += chunk.len() as u64;

            if !on_progress(state) {
                file.flush()
                    .await
                    .map_err(|e| TransferError::Fatal(format!("flush error: {}", e)))?;
                return Err(TransferError::Retryable("transfer aborted by caller".to_string()));
            }
        }

        file.flush()
            .await
            .map_err(|e| TransferError::Fatal(format!("flush error: {}", e)))?;
        Ok(())
    }
}

fn classify_request_error(e: reqwest::Error) -> TransferError {
    if e.is_builder() {
        TransferError::Fatal(format!("invalid request: {}", e))
    } else {
        TransferError::Retryable(e.to_string())
    }
}
