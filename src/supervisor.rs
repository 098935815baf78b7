// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runtime lifecycle supervision: detect-or-launch, readiness probing,
//! baseline model provisioning, orderly shutdown.
//!
//! The supervisor only ever terminates a subprocess it launched itself.
//! A runtime discovered already running on the port belongs to someone
//! else and is left untouched on `stop()`.
//!
//! Launch failure is non-fatal to the host application: it is logged,
//! readiness checks are skipped, and provisioning waits for the runtime
//! to become reachable by other means.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::config::DepotConfig;
use crate::errors::SupervisorError;
use crate::locks::resilient_lock;
use crate::pull::PullOrchestrator;

/// Timeout for a single TCP reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default grace period to wait for a launched runtime to answer.
const READY_GRACE: Duration = Duration::from_secs(10);

/// Base interval between readiness probes (linear backoff).
const READY_PROBE_STEP: Duration = Duration::from_millis(250);

/// How long `stop()` waits for a graceful exit before force-killing.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Plain TCP reachability probe against the runtime's port.
pub async fn probe_port(host: &str, port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Handle to a spawned runtime subprocess.
pub trait ProcessHandle: Send {
    /// OS process id.
    fn id(&self) -> u32;
    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;
    /// Ask the process to exit (SIGTERM or platform equivalent).
    fn terminate_graceful(&mut self) -> io::Result<()>;
    /// Kill the process outright.
    fn terminate_forceful(&mut self) -> io::Result<()>;
}

/// Capability seam for external-process lifecycle, so platform
/// differences (signals vs. kill-by-name) stay behind one interface.
pub trait ProcessControl: Send + Sync {
    /// Spawn a child process with diagnostics-friendly stdio.
    fn spawn(&self, program: &Path, args: &[&str]) -> io::Result<Box<dyn ProcessHandle>>;

    /// Forcefully kill any process with the given image name.
    ///
    /// Fallback for the platform where graceful termination is known
    /// to be unreliable; a no-op elsewhere.
    fn kill_by_name(&self, _name: &str) {}
}

struct OsProcessHandle {
    child: Child,
}

impl ProcessHandle for OsProcessHandle {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn terminate_graceful(&mut self) -> io::Result<()> {
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(self.child.id().to_string())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other("kill -TERM failed"))
        }
    }

    #[cfg(not(unix))]
    fn terminate_graceful(&mut self) -> io::Result<()> {
        // No reliable graceful signal here; the kill-by-name fallback
        // in stop() sweeps up anything this misses.
        self.child.kill()
    }

    fn terminate_forceful(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// OS-backed process control.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn spawn(&self, program: &Path, args: &[&str]) -> io::Result<Box<dyn ProcessHandle>> {
        let child = Command::new(program)
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(Box::new(OsProcessHandle { child }))
    }

    #[cfg(windows)]
    fn kill_by_name(&self, name: &str) {
        let result = Command::new("taskkill").args(["/F", "/IM", name]).status();
        if let Err(e) = result {
            tracing::warn!("taskkill {} failed: {}", name, e);
        }
    }
}

/// Supervises the inference runtime process and baseline provisioning.
pub struct RuntimeSupervisor {
    config: DepotConfig,
    orchestrator: PullOrchestrator,
    process: Arc<dyn ProcessControl>,
    handle: Mutex<Option<Box<dyn ProcessHandle>>>,
    ready_grace: Duration,
}

impl RuntimeSupervisor {
    /// Create a supervisor using real OS process control.
    pub fn new(config: DepotConfig, orchestrator: PullOrchestrator) -> Self {
        Self::with_process_control(config, orchestrator, Arc::new(OsProcessControl))
    }

    /// Create a supervisor with a custom process-control seam.
    pub fn with_process_control(
        config: DepotConfig,
        orchestrator: PullOrchestrator,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            process,
            handle: Mutex::new(None),
            ready_grace: READY_GRACE,
        }
    }

    /// Shrink or extend the readiness grace period.
    pub fn with_ready_grace(mut self, grace: Duration) -> Self {
        self.ready_grace = grace;
        self
    }

    /// Whether this supervisor launched (and still owns) a subprocess.
    pub fn owns_subprocess(&self) -> bool {
        resilient_lock(&self.handle).is_some()
    }

    /// Whether the runtime port currently answers.
    pub async fn is_ready(&self) -> bool {
        probe_port(&self.config.runtime_host, self.config.runtime_port).await
    }

    /// Detect or launch the runtime, then kick off baseline
    /// provisioning. Provisioning runs asynchronously; the host is
    /// usable (with degraded capability) before it completes.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.is_ready().await {
            tracing::info!(
                "Runtime already running on port {}",
                self.config.runtime_port
            );
            self.provision_baseline().await;
            return Ok(());
        }

        tracing::info!(
            "Runtime not found on port {}, attempting to start",
            self.config.runtime_port
        );
        let program = self.launch_program();
        let handle = self.process.spawn(&program, &["serve"]).map_err(|e| {
            tracing::error!(
                "Failed to start runtime process ({}). Ensure it is installed or bundled.",
                e
            );
            SupervisorError::LaunchFailed(e.to_string())
        })?;
        tracing::info!("Runtime started, PID {}", handle.id());
        *resilient_lock(&self.handle) = Some(handle);

        self.await_ready().await;
        self.provision_baseline().await;
        Ok(())
    }

    /// Stop the runtime subprocess, if we launched one.
    ///
    /// An externally running runtime (no handle recorded) is never
    /// touched.
    pub async fn stop(&self) {
        let handle = resilient_lock(&self.handle).take();
        let Some(mut handle) = handle else {
            tracing::debug!("No runtime subprocess owned by this supervisor; nothing to stop");
            return;
        };

        tracing::info!("Stopping runtime subprocess (PID {})", handle.id());
        if let Err(e) = handle.terminate_graceful() {
            tracing::warn!("Graceful termination failed: {}", e);
        }

        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            if !handle.is_alive() {
                tracing::info!("Runtime subprocess stopped");
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }

        tracing::warn!("Runtime did not exit gracefully, force killing");
        if let Err(e) = handle.terminate_forceful() {
            tracing::warn!("Force kill failed: {}", e);
        }
        self.process
            .kill_by_name(&image_name(&self.config.runtime_command));
    }

    /// Prefer a bundled runtime binary; fall back to the system command.
    fn launch_program(&self) -> PathBuf {
        let bundled = Path::new("bin").join(image_name(&self.config.runtime_command));
        if bundled.exists() {
            tracing::info!("Found bundled runtime: {}", bundled.display());
            bundled
        } else {
            tracing::info!("Using system runtime command: {}", self.config.runtime_command);
            PathBuf::from(&self.config.runtime_command)
        }
    }

    /// Probe with linear backoff until the port answers or the grace
    /// period expires. Timing out is a warning, not a failure.
    async fn await_ready(&self) {
        let start = Instant::now();
        let mut attempt: u32 = 1;
        while start.elapsed() < self.ready_grace {
            if self.is_ready().await {
                tracing::info!("Runtime ready after {:?}", start.elapsed());
                return;
            }
            sleep(READY_PROBE_STEP * attempt).await;
            attempt += 1;
        }
        tracing::warn!(
            "Runtime did not answer within {:?}; proceeding best-effort",
            self.ready_grace
        );
    }

    /// Ensure the baseline model set is present. Each call returns as
    /// soon as the job is registered; transfers run in the background.
    async fn provision_baseline(&self) {
        for model in self.config.baseline_models() {
            let handle = self.orchestrator.ensure_present(&model).await;
            tracing::info!(
                "Provisioning baseline model {} (status {:?})",
                handle.model(),
                handle.current().status
            );
        }
    }
}

fn image_name(command: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", command)
    } else {
        command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PullRegistry;
    use crate::runtime::RuntimeClient;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeHandle {
        alive: Arc<AtomicBool>,
        graceful: Arc<AtomicBool>,
        forceful: Arc<AtomicBool>,
    }

    impl ProcessHandle for FakeHandle {
        fn id(&self) -> u32 {
            4242
        }
        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn terminate_graceful(&mut self) -> io::Result<()> {
            self.graceful.store(true, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn terminate_forceful(&mut self) -> io::Result<()> {
            self.forceful.store(true, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeProcessControl {
        fail_spawn: bool,
        spawned: Arc<Mutex<Vec<String>>>,
        graceful: Arc<AtomicBool>,
        forceful: Arc<AtomicBool>,
    }

    impl ProcessControl for FakeProcessControl {
        fn spawn(&self, program: &Path, _args: &[&str]) -> io::Result<Box<dyn ProcessHandle>> {
            if self.fail_spawn {
                return Err(io::Error::new(io::ErrorKind::NotFound, "binary missing"));
            }
            self.spawned
                .lock()
                .unwrap()
                .push(program.display().to_string());
            Ok(Box::new(FakeHandle {
                alive: Arc::new(AtomicBool::new(true)),
                graceful: self.graceful.clone(),
                forceful: self.forceful.clone(),
            }))
        }
    }

    fn test_config(port: u16) -> DepotConfig {
        let mut config = DepotConfig::default();
        config.runtime_host = "127.0.0.1".to_string();
        config.runtime_port = port;
        config.retrieval_enabled = false;
        config
    }

    fn orchestrator_for(config: &DepotConfig) -> PullOrchestrator {
        PullOrchestrator::new(
            RuntimeClient::with_url(config.runtime_url()),
            PullRegistry::new(),
        )
    }

    #[tokio::test]
    async fn test_stop_is_noop_without_handle() {
        let config = test_config(59999);
        let orchestrator = orchestrator_for(&config);
        let control = Arc::new(FakeProcessControl::default());
        let supervisor =
            RuntimeSupervisor::with_process_control(config, orchestrator, control.clone());

        supervisor.stop().await;
        assert!(!supervisor.owns_subprocess());
        assert!(!control.graceful.load(Ordering::SeqCst));
        assert!(!control.forceful.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_externally_running_runtime_is_never_killed() {
        // A plain listener stands in for an externally started runtime.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = test_config(port);
        let orchestrator = orchestrator_for(&config);
        let control = Arc::new(FakeProcessControl::default());
        let supervisor =
            RuntimeSupervisor::with_process_control(config, orchestrator, control.clone());

        supervisor.start().await.unwrap();
        assert!(!supervisor.owns_subprocess(), "no handle for external runtime");
        assert!(control.spawned.lock().unwrap().is_empty());

        supervisor.stop().await;
        assert!(!control.graceful.load(Ordering::SeqCst));
        assert!(!control.forceful.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported_not_panicked() {
        let config = test_config(59998);
        let orchestrator = orchestrator_for(&config);
        let control = Arc::new(FakeProcessControl {
            fail_spawn: true,
            ..Default::default()
        });
        let supervisor =
            RuntimeSupervisor::with_process_control(config, orchestrator, control)
                .with_ready_grace(Duration::from_millis(10));

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::LaunchFailed(_)));
        assert!(!supervisor.owns_subprocess());
    }

    #[tokio::test]
    async fn test_launched_subprocess_is_stopped_gracefully() {
        let config = test_config(59997);
        let orchestrator = orchestrator_for(&config);
        let control = Arc::new(FakeProcessControl::default());
        let supervisor =
            RuntimeSupervisor::with_process_control(config, orchestrator, control.clone())
                .with_ready_grace(Duration::from_millis(10));

        supervisor.start().await.unwrap();
        assert!(supervisor.owns_subprocess());
        assert_eq!(control.spawned.lock().unwrap().len(), 1);

        supervisor.stop().await;
        assert!(control.graceful.load(Ordering::SeqCst));
        assert!(
            !control.forceful.load(Ordering::SeqCst),
            "graceful exit must not escalate"
        );
        assert!(!supervisor.owns_subprocess());
    }
}
