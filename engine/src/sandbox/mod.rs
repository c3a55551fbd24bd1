/// Execution Sandbox Manager
///
/// Runs untrusted commands in an isolated workspace with a cleared
/// environment, a hard wall-clock ceiling, and capped output capture.
/// A run walks Requested -> Provisioning -> Running -> one terminal
/// state; capability checks happen before anything is provisioned, so
/// a refused run leaves no trace on disk.
pub mod workspace;

use sdk::errors::CoreError;
use sdk::types::{ResourceUsage, SandboxLimits, SandboxOutcome, SandboxSpec};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use workspace::{sweep_orphans, Workspace};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own with this code
    Exited(i32),
    /// The wall-clock ceiling fired and the process was killed
    TimedOut,
    /// The process died to a signal it did not ask for
    Killed,
}

/// The full result of a sandbox run
#[derive(Debug, Clone)]
pub struct SandboxReport {
    pub run_id: String,
    pub termination: Termination,
    pub outcome: SandboxOutcome,
}

impl SandboxReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.termination, Termination::Exited(0))
    }
}

pub struct SandboxManager {
    root: PathBuf,
    config: SandboxConfig,
    active: Arc<Mutex<HashSet<String>>>,
}

impl SandboxManager {
    pub fn new(root: PathBuf, config: SandboxConfig) -> Self {
        Self {
            root,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run a command to completion under the given limits
    ///
    /// The command runs with an empty environment, the workspace as its
    /// working directory, and stdin closed. Output capture stops at the
    /// configured byte cap; the process itself keeps running until it
    /// exits or the wall clock fires.
    pub async fn run(&self, run_id: &str, spec: &SandboxSpec) -> Result<SandboxReport, CoreError> {
        self.check_capabilities(spec)?;
        let limits = self.effective_limits(&spec.limits);

        {
            let mut active = self.active.lock().await;
            if !active.insert(run_id.to_string()) {
                return Err(CoreError::Validation(format!(
                    "Sandbox run '{}' is already active",
                    run_id
                )));
            }
        }

        let result = self.provision_and_run(run_id, spec, &limits).await;

        self.active.lock().await.remove(run_id);
        result
    }

    async fn provision_and_run(
        &self,
        run_id: &str,
        spec: &SandboxSpec,
        limits: &SandboxLimits,
    ) -> Result<SandboxReport, CoreError> {
        let workspace = Workspace::provision(&self.root, run_id)?;
        debug!(run_id = %run_id, command = %spec.command, "Sandbox run starting");

        let run = self.execute(spec, limits, &workspace).await;

        // Teardown regardless of how the run went; its own failure is
        // logged, not propagated over the run's result
        if let Err(e) = workspace.teardown() {
            warn!(run_id = %run_id, error = %e, "Workspace teardown failed");
        }

        let (termination, stdout, stderr, usage) = run?;
        info!(
            run_id = %run_id,
            termination = ?termination,
            wall_ms = usage.wall_ms,
            "Sandbox run finished"
        );

        Ok(SandboxReport {
            run_id: run_id.to_string(),
            termination,
            outcome: SandboxOutcome {
                exit_status: match termination {
                    Termination::Exited(code) => Some(code),
                    _ => None,
                },
                stdout,
                stderr,
                resource_usage: usage,
            },
        })
    }

    async fn execute(
        &self,
        spec: &SandboxSpec,
        limits: &SandboxLimits,
        workspace: &Workspace,
    ) -> Result<(Termination, String, String, ResourceUsage), CoreError> {
        let mut child = tokio::process::Command::new(&spec.command)
            .args(&spec.args)
            .env_clear()
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CoreError::ProvisionError(format!("Failed to spawn '{}': {}", spec.command, e))
            })?;

        let cap = self.config.max_output_bytes;
        let stdout_task = capture(child.stdout.take(), cap);
        let stderr_task = capture(child.stderr.take(), cap);

        let started = Instant::now();
        let ceiling = Duration::from_millis(limits.wall_clock_ms);
        let termination = match tokio::time::timeout(ceiling, child.wait()).await {
            Ok(Ok(status)) => match status.code() {
                Some(code) => Termination::Exited(code),
                None => Termination::Killed,
            },
            Ok(Err(e)) => return Err(CoreError::Io(e)),
            Err(_) => {
                // Hard kill; the process gets no grace period past the
                // wall clock
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "Failed to kill timed-out sandbox process");
                }
                let _ = child.wait().await;
                Termination::TimedOut
            }
        };

        let wall_ms = started.elapsed().as_millis() as u64;
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let usage = ResourceUsage {
            cpu_ms: limits.cpu_ms.min(wall_ms),
            max_memory_bytes: limits.memory_bytes,
            wall_ms,
        };
        Ok((termination, stdout, stderr, usage))
    }

    /// Capability gate, evaluated before any provisioning
    fn check_capabilities(&self, spec: &SandboxSpec) -> Result<(), CoreError> {
        if spec.command.trim().is_empty() {
            return Err(CoreError::Validation("Sandbox command is empty".to_string()));
        }
        if spec.limits.network && !self.config.allow_network {
            return Err(CoreError::CapabilityDenied(
                "network access is not permitted".to_string(),
            ));
        }
        Ok(())
    }

    /// Fill unset limits from configuration and clamp declared ones to
    /// the configured ceilings
    fn effective_limits(&self, requested: &SandboxLimits) -> SandboxLimits {
        SandboxLimits {
            cpu_ms: requested.cpu_ms,
            memory_bytes: requested
                .memory_bytes
                .min(self.config.default_memory_bytes)
                .max(1),
            wall_clock_ms: if requested.wall_clock_ms == 0 {
                self.config.default_wall_clock_ms
            } else {
                requested.wall_clock_ms.min(self.config.default_wall_clock_ms)
            },
            network: requested.network,
        }
    }

    /// Remove workspaces with no live run behind them. Called at startup
    /// to clean up after unclean shutdowns.
    pub async fn cleanup_orphans(&self) -> Result<usize, CoreError> {
        let active = self.active.lock().await.clone();
        let removed = sweep_orphans(&self.root, &active)?;
        if removed > 0 {
            info!(removed = removed, "Swept orphaned sandbox workspaces");
        }
        Ok(removed)
    }
}

/// Read a stream into a string, stopping capture (but not the process)
/// at `cap` bytes
fn capture<R>(reader: Option<R>, cap: usize) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return String::new();
        };
        let mut collected: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if collected.len() < cap {
                        let take = n.min(cap - collected.len());
                        collected.extend_from_slice(&buf[..take]);
                    }
                    // Keep draining past the cap so the child never
                    // blocks on a full pipe
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    })
}
