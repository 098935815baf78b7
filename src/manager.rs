// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The narrow model-management surface the rest of the application
//! consumes: current/active model, availability checks, model
//! switching, and per-model progress subscriptions.
//!
//! Two tiers are configured out of the box: a lightweight chat model
//! the runtime manages by name, and an optional heavyweight "pro"
//! model acquired as a raw weights file.

use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{bail, Result};
use tokio::sync::watch;

use crate::config::DepotConfig;
use crate::locks::{resilient_read, resilient_write};
use crate::pull::{ModelArtifact, PullJob, PullJobHandle, PullOrchestrator};

/// Application-facing model management.
pub struct ModelManager {
    config: DepotConfig,
    orchestrator: PullOrchestrator,
    active_model: RwLock<String>,
}

impl ModelManager {
    /// Create a manager; the configured chat model starts active.
    pub fn new(config: DepotConfig, orchestrator: PullOrchestrator) -> Self {
        let active = config.chat_model.clone();
        Self {
            config,
            orchestrator,
            active_model: RwLock::new(active),
        }
    }

    /// The currently active model identifier.
    pub fn current_model(&self) -> String {
        resilient_read(&self.active_model).clone()
    }

    /// Whether a model is available right now.
    ///
    /// The pro alias checks the artifact file on disk; named models ask
    /// the runtime's tag list. An unreachable runtime reads as "not
    /// available" rather than an error.
    pub async fn is_model_available(&self, model: &str) -> bool {
        if model == self.config.pro_model_alias {
            return self.is_pro_available();
        }
        self.orchestrator
            .client()
            .has_model(model)
            .await
            .unwrap_or(false)
    }

    /// Switch the active model.
    ///
    /// Refuses to switch to a model that is not available yet; the
    /// caller should acquire it first and retry.
    pub async fn switch_active_model(&self, model: &str) -> Result<()> {
        if !self.is_model_available(model).await {
            bail!("Model {} is not available yet", model);
        }
        *resilient_write(&self.active_model) = model.to_string();
        tracing::info!("Switched active model to {}", model);
        Ok(())
    }

    /// Whether the pro artifact is fully on disk.
    ///
    /// A live acquisition job keyed by the artifact path means the
    /// bytes on disk are an incomplete prefix, whatever their size.
    pub fn is_pro_available(&self) -> bool {
        let path = self.pro_model_path();
        if self.pull_progress(&path.display().to_string()).is_some() {
            return false;
        }
        std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false)
    }

    /// Filesystem path of the pro artifact.
    pub fn pro_model_path(&self) -> PathBuf {
        self.config.pro_model_path()
    }

    /// Start (or join) the pro artifact download.
    ///
    /// Dedup lives in the pull registry, so calling this repeatedly
    /// while a download is live returns the same job.
    pub async fn start_pro_download(&self) -> PullJobHandle {
        self.orchestrator
            .acquire(ModelArtifact::raw_file(
                self.config.pro_model_url.clone(),
                self.pro_model_path(),
            ))
            .await
    }

    /// Ensure a named model is present (idempotent).
    pub async fn ensure_model(&self, model: &str) -> PullJobHandle {
        self.orchestrator.ensure_present(model).await
    }

    /// Cancel a live acquisition job.
    pub fn cancel(&self, model: &str) -> bool {
        self.orchestrator.cancel(model)
    }

    /// Non-blocking progress snapshot for a model identifier.
    pub fn pull_progress(&self, model: &str) -> Option<PullJob> {
        self.orchestrator.registry().get(model)
    }

    /// Subscribe to progress events for a live job.
    pub fn subscribe_progress(&self, model: &str) -> Option<watch::Receiver<PullJob>> {
        self.orchestrator.registry().subscribe(model)
    }

    /// Snapshot of all live jobs.
    pub fn jobs(&self) -> Vec<PullJob> {
        self.orchestrator.registry().snapshot()
    }

    /// The configuration backing this manager.
    pub fn config(&self) -> &DepotConfig {
        &self.config
    }
}
