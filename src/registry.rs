// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Registry of in-flight pull jobs.
//!
//! One explicitly-owned concurrent map keyed by model identifier.
//! `get_or_create` is the sole dedup gate and is atomic under a single
//! write lock — there is no check-then-act window in which two callers
//! can both believe they created the job.
//!
//! Each entry carries a `tokio::sync::watch` channel holding the job
//! value. Status reads are snapshot borrows, never blocking on a
//! writer's I/O; subscribers holding a receiver still see the terminal
//! value after the entry is evicted.
//!
//! Mutations from a job's own task go through `update_owned`, keyed to
//! the entry's cancel flag. A task whose job has been cancelled and
//! replaced holds a stale flag and cannot write into the successor.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::locks::{resilient_read, resilient_write};
use crate::pull::{ArtifactKind, CancelFlag, PullJob};

struct Entry {
    job_tx: watch::Sender<PullJob>,
    cancel: CancelFlag,
}

/// Thread-safe map of live pull jobs.
#[derive(Clone, Default)]
pub struct PullRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl std::fmt::Debug for PullRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = resilient_read(&self.entries);
        f.debug_struct("PullRegistry")
            .field("jobs", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PullRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live job for `model`, or atomically create one.
    ///
    /// Returns the job snapshot, a progress subscription, the job's
    /// cancel flag, and whether this call created the job. When
    /// `is_new` is false the caller must not start a second transfer.
    pub fn get_or_create(
        &self,
        model: &str,
        kind: ArtifactKind,
    ) -> (PullJob, watch::Receiver<PullJob>, CancelFlag, bool) {
        let mut entries = resilient_write(&self.entries);

        if let Some(entry) = entries.get(model) {
            let job = entry.job_tx.borrow().clone();
            // A terminal entry is a leftover mid-eviction; replace it.
            if !job.status.is_terminal() {
                return (job, entry.job_tx.subscribe(), entry.cancel.clone(), false);
            }
        }

        let job = PullJob::new(model, kind);
        let (job_tx, job_rx) = watch::channel(job.clone());
        let cancel = CancelFlag::new();
        entries.insert(
            model.to_string(),
            Entry {
                job_tx,
                cancel: cancel.clone(),
            },
        );
        (job, job_rx, cancel, true)
    }

    /// Apply a mutation to a live job, notifying subscribers.
    ///
    /// Returns the updated snapshot, or `None` if no entry exists
    /// (evicted jobs silently absorb late updates).
    pub fn update<F>(&self, model: &str, mutate: F) -> Option<PullJob>
    where
        F: FnOnce(&mut PullJob),
    {
        let entries = resilient_read(&self.entries);
        let entry = entries.get(model)?;
        entry.job_tx.send_modify(mutate);
        let job = entry.job_tx.borrow().clone();
        Some(job)
    }

    /// Like [`Self::update`], but only applied if `owner` is the live
    /// entry's cancel flag.
    ///
    /// A task whose job was cancelled and replaced under the same
    /// identifier still holds the old flag; its late writes are
    /// rejected here instead of landing on the successor job.
    pub fn update_owned<F>(&self, model: &str, owner: &CancelFlag, mutate: F) -> Option<PullJob>
    where
        F: FnOnce(&mut PullJob),
    {
        let entries = resilient_read(&self.entries);
        let entry = entries.get(model)?;
        if !entry.cancel.same_job(owner) {
            return None;
        }
        entry.job_tx.send_modify(mutate);
        let job = entry.job_tx.borrow().clone();
        Some(job)
    }

    /// Remove an entry, returning its last job value.
    pub fn remove(&self, model: &str) -> Option<PullJob> {
        let mut entries = resilient_write(&self.entries);
        entries.remove(model).map(|e| e.job_tx.borrow().clone())
    }

    /// Remove an entry only if `owner` is the live entry's cancel flag.
    pub fn remove_owned(&self, model: &str, owner: &CancelFlag) -> Option<PullJob> {
        let mut entries = resilient_write(&self.entries);
        match entries.get(model) {
            Some(entry) if entry.cancel.same_job(owner) => {}
            _ => return None,
        }
        entries.remove(model).map(|e| e.job_tx.borrow().clone())
    }

    /// Non-blocking snapshot of one job.
    pub fn get(&self, model: &str) -> Option<PullJob> {
        let entries = resilient_read(&self.entries);
        entries.get(model).map(|e| e.job_tx.borrow().clone())
    }

    /// Subscribe to a live job's updates.
    pub fn subscribe(&self, model: &str) -> Option<watch::Receiver<PullJob>> {
        let entries = resilient_read(&self.entries);
        entries.get(model).map(|e| e.job_tx.subscribe())
    }

    /// The cancel flag of a live job.
    pub fn cancel_flag(&self, model: &str) -> Option<CancelFlag> {
        let entries = resilient_read(&self.entries);
        entries.get(model).map(|e| e.cancel.clone())
    }

    /// Snapshot of all live jobs, ordered by start time.
    pub fn snapshot(&self) -> Vec<PullJob> {
        let entries = resilient_read(&self.entries);
        let mut jobs: Vec<PullJob> = entries.values().map(|e| e.job_tx.borrow().clone()).collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.model.cmp(&b.model)));
        jobs
    }

    /// Number of live jobs.
    pub fn len(&self) -> usize {
        resilient_read(&self.entries).len()
    }

    /// Whether the registry has no live jobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pull::PullStatus;

    #[test]
    fn test_get_or_create_dedups() {
        let registry = PullRegistry::new();

        let (job, _rx, _cancel, is_new) = registry.get_or_create("m", ArtifactKind::Named);
        assert!(is_new);
        assert_eq!(job.status, PullStatus::Queued);

        let (again, _rx2, _c2, is_new2) = registry.get_or_create("m", ArtifactKind::Named);
        assert!(!is_new2);
        assert_eq!(again.model, "m");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_terminal_entry_is_replaced() {
        let registry = PullRegistry::new();
        let (_, _rx, _c, _) = registry.get_or_create("m", ArtifactKind::Named);
        registry.update("m", |job| job.status = PullStatus::Failed);

        let (job, _rx2, _c2, is_new) = registry.get_or_create("m", ArtifactKind::Named);
        assert!(is_new, "terminal leftovers must not dedup");
        assert_eq!(job.status, PullStatus::Queued);
    }

    #[test]
    fn test_update_notifies_subscribers() {
        let registry = PullRegistry::new();
        let (_, rx, _c, _) = registry.get_or_create("m", ArtifactKind::Named);

        let updated = registry.update("m", |job| {
            job.status = PullStatus::Downloading;
            job.bytes_completed = 42;
        });
        assert_eq!(updated.unwrap().bytes_completed, 42);
        assert_eq!(rx.borrow().status, PullStatus::Downloading);
    }

    #[test]
    fn test_update_after_remove_is_noop() {
        let registry = PullRegistry::new();
        let (_, rx, _c, _) = registry.get_or_create("m", ArtifactKind::Named);
        registry.remove("m");

        assert!(registry.update("m", |job| job.bytes_completed = 99).is_none());
        assert_eq!(rx.borrow().bytes_completed, 0);
    }

    #[test]
    fn test_receiver_outlives_eviction() {
        let registry = PullRegistry::new();
        let (_, rx, _c, _) = registry.get_or_create("m", ArtifactKind::Named);
        registry.update("m", |job| job.status = PullStatus::Succeeded);
        registry.remove("m");

        // Last-known status survives for existing subscribers.
        assert_eq!(rx.borrow().status, PullStatus::Succeeded);
        assert!(registry.get("m").is_none());
    }

    #[test]
    fn test_stale_owner_writes_are_rejected() {
        let registry = PullRegistry::new();
        let (_, _rx, old_flag, _) = registry.get_or_create("m", ArtifactKind::Named);
        registry.update("m", |job| job.status = PullStatus::Cancelled);
        registry.remove("m");

        let (_, _rx2, _new_flag, is_new) = registry.get_or_create("m", ArtifactKind::Named);
        assert!(is_new);

        // The predecessor's task still holds the old flag; its late
        // writes must not land on the fresh job.
        assert!(registry
            .update_owned("m", &old_flag, |job| job.status = PullStatus::Failed)
            .is_none());
        assert!(registry.remove_owned("m", &old_flag).is_none());
        assert_eq!(registry.get("m").unwrap().status, PullStatus::Queued);

        // The live owner updates normally.
        let live = registry.cancel_flag("m").unwrap();
        assert!(registry
            .update_owned("m", &live, |job| job.bytes_completed = 7)
            .is_some());
        assert_eq!(registry.get("m").unwrap().bytes_completed, 7);
        assert!(registry.remove_owned("m", &live).is_some());
        assert!(registry.get("m").is_none());
    }

    #[test]
    fn test_snapshot_ordered_by_start_time() {
        let registry = PullRegistry::new();
        registry.get_or_create("b", ArtifactKind::Named);
        registry.get_or_create("a", ArtifactKind::Named);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].started_at <= snapshot[1].started_at);
    }
}
