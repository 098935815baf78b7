// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modeldepot - model acquisition and runtime supervision.
//!
//! Acquires large model artifacts over unreliable networks with
//! resumability, drives streaming pulls against a locally running
//! inference runtime with dedup and cancellation, and supervises the
//! lifecycle of that runtime (detect-or-launch, readiness probing,
//! baseline provisioning).
//!
//! # Core Modules
//!
//! - [`transfer`] - Resumable byte-range downloads for raw artifacts
//! - [`registry`] - Concurrent map of in-flight pull jobs
//! - [`pull`] - Pull jobs and the orchestrator driving them
//! - [`runtime`] - Minimal client for the runtime's tags/pull API
//! - [`supervisor`] - Runtime process lifecycle and provisioning
//! - [`manager`] - The narrow surface exposed to the host application
//! - [`config`] - File-backed settings
//! - [`errors`] - Error taxonomy

pub mod config;
pub mod errors;
pub mod locks;
pub mod manager;
pub mod pull;
pub mod registry;
pub mod runtime;
pub mod supervisor;
pub mod transfer;

// Re-export commonly used types
pub use config::DepotConfig;
pub use errors::{PullError, SupervisorError, TransferError};
pub use manager::ModelManager;
pub use pull::{
    ArtifactKind, CancelFlag, ModelArtifact, PullJob, PullJobHandle, PullOrchestrator, PullStatus,
};
pub use registry::PullRegistry;
pub use runtime::{ModelInfo, PullLine, RuntimeClient, RuntimeError};
pub use supervisor::{probe_port, OsProcessControl, ProcessControl, ProcessHandle, RuntimeSupervisor};
pub use transfer::{TransferEngine, TransferState, TransferStatus};
