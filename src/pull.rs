// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pull jobs and the orchestrator that drives them.
//!
//! One job per model identifier, ever. `ensure_present` is idempotent:
//! concurrent callers racing on the same identifier all land on the
//! same job and exactly one transfer runs. Terminal jobs are evicted
//! from the registry immediately after the terminal transition, so a
//! retry is just another `ensure_present` call starting clean.
//!
//! Named models stream through the runtime's pull API; raw artifact
//! files go through the resumable transfer engine. Both report through
//! the same registry entries.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::registry::PullRegistry;
use crate::runtime::{PullStreamEnd, RuntimeClient};
use crate::transfer::TransferEngine;

/// Cooperative cancellation flag, checked between stream chunks.
///
/// Raising it stops the local read loop; it cannot abort work the
/// runtime may continue doing server-side.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, unraised flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether two flags belong to the same job. The flag doubles as
    /// the job's identity token for registry writes.
    pub(crate) fn same_job(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// What kind of artifact a job acquires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// A model the runtime resolves and stores by name.
    Named,
    /// A raw weights file downloaded directly to disk.
    RawFile,
}

/// An acquirable unit: a named runtime model or a raw weights file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelArtifact {
    /// Named model, e.g. "qwen2.5:0.5b".
    Named { name: String },
    /// Raw artifact file fetched from an arbitrary URL.
    RawFile { url: String, destination: PathBuf },
}

impl ModelArtifact {
    /// A named runtime model.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named { name: name.into() }
    }

    /// A raw artifact file.
    pub fn raw_file(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self::RawFile {
            url: url.into(),
            destination: destination.into(),
        }
    }

    /// The identifier jobs for this artifact are keyed by.
    pub fn identifier(&self) -> String {
        match self {
            Self::Named { name } => name.clone(),
            Self::RawFile { destination, .. } => destination.display().to_string(),
        }
    }

    /// The artifact kind.
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Named { .. } => ArtifactKind::Named,
            Self::RawFile { .. } => ArtifactKind::RawFile,
        }
    }
}

/// Status of a pull job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullStatus {
    /// Created, transfer not started yet.
    Queued,
    /// Transfer in progress.
    Downloading,
    /// Stream finished, presence re-check against the runtime running.
    Verifying,
    /// Done; the artifact is available.
    Succeeded,
    /// Done; the artifact is not available. See the job message.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl PullStatus {
    /// Terminal states are evicted from the registry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether a transfer is actively running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Verifying)
    }
}

/// One in-flight (or just-finished) model acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullJob {
    /// Unique key: model name, or destination path for raw files.
    pub model: String,
    /// What kind of artifact this job acquires.
    pub kind: ArtifactKind,
    /// Current status.
    pub status: PullStatus,
    /// Total bytes, unknown during the manifest phase and for raw
    /// downloads without a declared length.
    pub bytes_total: Option<u64>,
    /// Bytes completed so far. Monotonically non-decreasing until a
    /// terminal state.
    pub bytes_completed: u64,
    /// Last human-readable status message from the stream.
    pub message: String,
    /// When the job was created.
    pub started_at: DateTime<Utc>,
}

impl PullJob {
    /// Create a fresh queued job.
    pub fn new(model: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            model: model.into(),
            kind,
            status: PullStatus::Queued,
            bytes_total: None,
            bytes_completed: 0,
            message: "queued".to_string(),
            started_at: Utc::now(),
        }
    }

    /// Completion percentage, clamped to [0, 100].
    ///
    /// `None` means indeterminate: byte counts are not known yet.
    pub fn percentage(&self) -> Option<f64> {
        match self.status {
            PullStatus::Succeeded => Some(100.0),
            PullStatus::Queued => Some(0.0),
            _ => match self.bytes_total {
                Some(total) if total > 0 => {
                    Some(((self.bytes_completed as f64 / total as f64) * 100.0).clamp(0.0, 100.0))
                }
                _ => None,
            },
        }
    }
}

/// Handle to a pull job, for polling or awaiting completion.
///
/// Holds a watch subscription, so the terminal state stays readable
/// here even after the job is evicted from the registry.
#[derive(Debug, Clone)]
pub struct PullJobHandle {
    model: String,
    rx: watch::Receiver<PullJob>,
}

impl PullJobHandle {
    pub(crate) fn new(model: String, rx: watch::Receiver<PullJob>) -> Self {
        Self { model, rx }
    }

    /// The model identifier this handle tracks.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Non-blocking snapshot of the job.
    pub fn current(&self) -> PullJob {
        self.rx.borrow().clone()
    }

    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.rx.borrow().status.is_terminal()
    }

    /// Wait for the next state change, or `None` once the job's sender
    /// side is gone.
    pub async fn changed(&mut self) -> Option<PullJob> {
        if self.rx.changed().await.is_err() {
            return None;
        }
        Some(self.rx.borrow().clone())
    }

    /// Wait for the job to reach a terminal state.
    pub async fn wait(&mut self) -> PullJob {
        loop {
            if self.rx.borrow().status.is_terminal() {
                return self.rx.borrow().clone();
            }
            if self.rx.changed().await.is_err() {
                // Sender gone; last value is all we will ever get.
                return self.rx.borrow().clone();
            }
        }
    }
}

/// Drives model acquisition jobs against the runtime and the transfer
/// engine, tracking them in the pull registry.
#[derive(Debug, Clone)]
pub struct PullOrchestrator {
    client: RuntimeClient,
    engine: TransferEngine,
    registry: PullRegistry,
}

impl PullOrchestrator {
    /// Create an orchestrator over the given client and registry.
    pub fn new(client: RuntimeClient, registry: PullRegistry) -> Self {
        Self {
            client,
            engine: TransferEngine::new(),
            registry,
        }
    }

    /// Replace the transfer engine (mainly for tests).
    pub fn with_engine(mut self, engine: TransferEngine) -> Self {
        self.engine = engine;
        self
    }

    /// The registry this orchestrator tracks jobs in.
    pub fn registry(&self) -> &PullRegistry {
        &self.registry
    }

    /// The runtime client.
    pub fn client(&self) -> &RuntimeClient {
        &self.client
    }

    /// Ensure a named model is present, starting a pull if needed.
    ///
    /// If a job for this identifier is already live, its handle is
    /// returned and no second transfer starts.
    pub async fn ensure_present(&self, model: &str) -> PullJobHandle {
        self.acquire(ModelArtifact::named(model)).await
    }

    /// Ensure an artifact (named or raw) is present.
    pub async fn acquire(&self, artifact: ModelArtifact) -> PullJobHandle {
        let id = artifact.identifier();
        let (_, rx, cancel, is_new) = self.registry.get_or_create(&id, artifact.kind());
        let handle = PullJobHandle::new(id.clone(), rx);

        if !is_new {
            // Dedup: the existing live job is the job.
            return handle;
        }

        let this = self.clone();
        tokio::spawn(async move {
            match artifact {
                ModelArtifact::Named { name } => this.run_named(name, cancel).await,
                ModelArtifact::RawFile { url, destination } => {
                    this.run_raw(id, url, destination, cancel).await
                }
            }
        });

        handle
    }

    /// Cancel a live job.
    ///
    /// Returns `true` if a live job was transitioned to `Cancelled`.
    /// The terminal transition goes out to every subscriber before the
    /// entry is evicted, so blocked pollers wake up, and a subsequent
    /// `ensure_present` for the identifier starts a fresh job.
    pub fn cancel(&self, model: &str) -> bool {
        let Some(flag) = self.registry.cancel_flag(model) else {
            return false;
        };
        flag.cancel();

        let updated = self.registry.update_owned(model, &flag, |job| {
            if !job.status.is_terminal() {
                job.status = PullStatus::Cancelled;
                job.message = "cancelled".to_string();
            }
        });

        match updated {
            Some(job) if job.status == PullStatus::Cancelled => {
                self.registry.remove_owned(model, &flag);
                tracing::info!("Cancelled pull job for {}", model);
                true
            }
            _ => false,
        }
    }

    /// Terminal transition followed by registry eviction, applied only
    /// if `owner` still identifies the live job.
    fn finish(&self, id: &str, owner: &CancelFlag, status: PullStatus, message: impl Into<String>) {
        let message = message.into();
        self.registry.update_owned(id, owner, |job| {
            if job.status.is_terminal() {
                return;
            }
            if status == PullStatus::Succeeded {
                if let Some(total) = job.bytes_total {
                    job.bytes_completed = total;
                }
            }
            job.status = status;
            job.message = message.clone();
        });
        self.registry.remove_owned(id, owner);
    }

    async fn run_named(self, name: String, cancel: CancelFlag) {
        // Already present? No transfer needed.
        match self.client.has_model(&name).await {
            Ok(true) => {
                tracing::info!("Model {} already present, skipping pull", name);
                self.finish(&name, &cancel, PullStatus::Succeeded, "already present");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Presence check for {} failed: {}", name, e);
                self.finish(&name, &cancel, PullStatus::Failed, e.to_string());
                return;
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        self.registry.update_owned(&name, &cancel, |job| {
            if !job.status.is_terminal() {
                job.status = PullStatus::Downloading;
                job.message = "requesting pull".to_string();
            }
        });
        tracing::info!("Pulling model {}", name);

        let registry = self.registry.clone();
        let job_id = name.clone();
        let owner = cancel.clone();
        let result = self
            .client
            .pull_stream(&name, &cancel, |line| {
                registry.update_owned(&job_id, &owner, |job| {
                    if job.status.is_terminal() {
                        return;
                    }
                    job.message = line.status.clone();
                    if let (Some(total), Some(completed)) = (line.total, line.completed) {
                        // Layer boundaries can reset the counters; keep
                        // observed progress monotonic.
                        job.bytes_total = Some(total.max(job.bytes_total.unwrap_or(0)));
                        if completed > job.bytes_completed {
                            job.bytes_completed = completed;
                        }
                    }
                });
            })
            .await;

        match result {
            Ok(PullStreamEnd::Success) => {
                self.registry.update_owned(&name, &cancel, |job| {
                    if !job.status.is_terminal() {
                        job.status = PullStatus::Verifying;
                        job.message = "verifying".to_string();
                    }
                });
                match self.client.has_model(&name).await {
                    Ok(false) => {
                        self.finish(
                            &name,
                            &cancel,
                            PullStatus::Failed,
                            "pull reported success but model is not listed",
                        );
                    }
                    // A listing hiccup does not fail a completed pull.
                    _ => {
                        tracing::info!("Model {} pulled successfully", name);
                        self.finish(&name, &cancel, PullStatus::Succeeded, "success");
                    }
                }
            }
            Ok(PullStreamEnd::Cancelled) => {
                // cancel() already transitioned and evicted the job.
                tracing::info!("Pull of {} stopped after cancellation", name);
            }
            Err(e) => {
                // A dropped connection can surface as a stream error
                // before the cancel flag is consulted; a fresh job may
                // already be running under this identifier by then.
                if cancel.is_cancelled() {
                    tracing::info!("Pull of {} stopped after cancellation", name);
                    return;
                }
                tracing::warn!("Pull of {} failed: {}", name, e);
                self.finish(&name, &cancel, PullStatus::Failed, e.to_string());
            }
        }
    }

    async fn run_raw(self, id: String, url: String, destination: PathBuf, cancel: CancelFlag) {
        self.registry.update_owned(&id, &cancel, |job| {
            if !job.status.is_terminal() {
                job.status = PullStatus::Downloading;
                job.message = "downloading artifact".to_string();
            }
        });
        tracing::info!("Downloading raw artifact {} -> {}", url, destination.display());

        let registry = self.registry.clone();
        let job_id = id.clone();
        let flag = cancel.clone();
        let result = self
            .engine
            .download_with_progress(&url, &destination, move |state| {
                if flag.is_cancelled() {
                    return false;
                }
                registry.update_owned(&job_id, &flag, |job| {
                    if job.status.is_terminal() {
                        return;
                    }
                    // No declared total; progress is indeterminate but
                    // byte counts are still surfaced.
                    let on_disk = state.bytes_on_disk();
                    if on_disk > job.bytes_completed {
                        job.bytes_completed = on_disk;
                    }
                });
                true
            })
            .await;

        if cancel.is_cancelled() {
            tracing::info!("Raw download of {} stopped after cancellation", id);
            return;
        }

        match result {
            Ok(bytes) => {
                tracing::info!("Raw artifact {} complete ({} bytes this call)", id, bytes);
                self.finish(&id, &cancel, PullStatus::Succeeded, "download complete");
            }
            Err(e) => {
                tracing::warn!("Raw download of {} failed: {}", id, e);
                self.finish(&id, &cancel, PullStatus::Failed, e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_artifact_identifier() {
        let named = ModelArtifact::named("qwen2.5:0.5b");
        assert_eq!(named.identifier(), "qwen2.5:0.5b");
        assert_eq!(named.kind(), ArtifactKind::Named);

        let raw = ModelArtifact::raw_file("https://example.com/m.gguf", "/models/m.gguf");
        assert_eq!(raw.identifier(), "/models/m.gguf");
        assert_eq!(raw.kind(), ArtifactKind::RawFile);
    }

    #[test]
    fn test_status_predicates() {
        assert!(PullStatus::Succeeded.is_terminal());
        assert!(PullStatus::Failed.is_terminal());
        assert!(PullStatus::Cancelled.is_terminal());
        assert!(!PullStatus::Queued.is_terminal());
        assert!(PullStatus::Downloading.is_active());
        assert!(!PullStatus::Succeeded.is_active());
    }

    #[test]
    fn test_job_percentage() {
        let mut job = PullJob::new("m", ArtifactKind::Named);
        assert_eq!(job.percentage(), Some(0.0));

        job.status = PullStatus::Downloading;
        assert_eq!(job.percentage(), None, "indeterminate without totals");

        job.bytes_total = Some(200);
        job.bytes_completed = 50;
        assert_eq!(job.percentage(), Some(25.0));

        job.bytes_completed = 500;
        assert_eq!(job.percentage(), Some(100.0), "clamped");

        job.status = PullStatus::Succeeded;
        assert_eq!(job.percentage(), Some(100.0));
    }
}
