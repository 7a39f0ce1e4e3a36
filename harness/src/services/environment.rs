//! Ephemeral container environment lifecycle
//!
//! The environment is a small state machine around a [`ContainerBackend`].
//! Provisioning is the only step that fights a flaky backend, so it runs
//! under a retry budget with a bounded per-attempt timeout; teardown is
//! always best-effort because a failed cleanup must never abort the run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::RunOptions;
use crate::error::{HarnessError, HarnessResult};
use crate::services::invoker::{Invocation, RunInvoker};
use crate::traits::ContainerBackend;

const PROVISION_RETRY_BUDGET: u32 = 5;
const PROVISION_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
const PROVISION_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Uninitialized,
    Created,
    Configured,
    Started,
    Stopped,
    Deleted,
}

impl std::fmt::Display for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnvState::Uninitialized => "uninitialized",
            EnvState::Created => "created",
            EnvState::Configured => "configured",
            EnvState::Started => "started",
            EnvState::Stopped => "stopped",
            EnvState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    pub name: String,
    pub distro: String,
    pub release: String,
    pub arch: String,
    pub stop_timeout: u64,
    pub source_dir: PathBuf,
    pub retry_budget: u32,
    pub attempt_timeout: Duration,
    pub progress_interval: Duration,
}

impl EnvironmentSettings {
    pub fn from_options(options: &RunOptions) -> Self {
        Self {
            name: options.container_name.clone(),
            distro: options.distro.clone(),
            release: options.release.clone(),
            arch: options.arch.clone(),
            stop_timeout: options.stop_timeout,
            source_dir: options.source_dir.clone(),
            retry_budget: PROVISION_RETRY_BUDGET,
            attempt_timeout: PROVISION_ATTEMPT_TIMEOUT,
            progress_interval: PROVISION_PROGRESS_INTERVAL,
        }
    }

    /// Shrink the retry timings for tests.
    pub fn with_timings(mut self, attempt_timeout: Duration, progress_interval: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self.progress_interval = progress_interval;
        self
    }
}

/// Mutable state machine instance representing the isolated execution
/// context. At most one live environment exists per run.
pub struct Environment {
    settings: EnvironmentSettings,
    backend: Arc<dyn ContainerBackend>,
    state: EnvState,
    provision_attempts: u32,
}

impl Environment {
    pub fn new(settings: EnvironmentSettings, backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            settings,
            backend,
            state: EnvState::Uninitialized,
            provision_attempts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    /// Provisioning attempts consumed by the last `create` call.
    pub fn provision_attempts(&self) -> u32 {
        self.provision_attempts
    }

    /// Provision the container, retrying on backend flakiness.
    ///
    /// Each attempt is bounded by a timeout; while it is pending, progress
    /// is logged on a coarse interval. A failed attempt is followed by a
    /// best-effort delete of any partially-created container before the
    /// next try. Exhausting the budget is fatal to containerized runs.
    pub async fn create(&mut self) -> HarnessResult<()> {
        let image = format!("{}:{}", self.settings.distro, self.settings.release);
        self.provision_attempts = 0;

        let mut last_error = String::new();
        for attempt in 1..=self.settings.retry_budget {
            self.provision_attempts = attempt;
            info!(
                "provisioning container '{}' from {} (attempt {}/{})",
                self.settings.name, image, attempt, self.settings.retry_budget
            );

            match self.provision_once(&image).await {
                Ok(()) => {
                    self.state = EnvState::Created;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "container provisioning attempt {} failed: {}",
                        attempt, e
                    );
                    last_error = e.to_string();

                    // The backend may have left a half-created container
                    // behind; remove it before the next attempt.
                    if let Err(cleanup) = self.backend.delete(&self.settings.name).await {
                        debug!("cleanup of partial container failed: {}", cleanup);
                    }
                }
            }
        }

        Err(HarnessError::ContainerProvisioning {
            attempts: self.settings.retry_budget,
            message: last_error,
        })
    }

    async fn provision_once(&self, image: &str) -> HarnessResult<()> {
        let init = self.backend.init(&self.settings.name, image);
        tokio::pin!(init);

        let deadline = tokio::time::sleep(self.settings.attempt_timeout);
        tokio::pin!(deadline);

        let mut progress = tokio::time::interval(self.settings.progress_interval);
        progress.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                result = &mut init => return result,
                _ = &mut deadline => {
                    // Dropping the init future cancels the attempt.
                    return Err(HarnessError::ContainerState {
                        state: self.state.to_string(),
                        operation: format!(
                            "provisioning timed out after {:?}",
                            self.settings.attempt_timeout
                        ),
                    });
                }
                _ = progress.tick() => {
                    debug!(
                        "still provisioning container '{}'...",
                        self.settings.name
                    );
                }
            }
        }
    }

    /// Map the invoking user into the container's id namespace and
    /// bind-mount the source tree at an identical path inside.
    pub async fn configure(&mut self) -> HarnessResult<()> {
        self.expect_state(EnvState::Created, "configure")?;

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        self.backend
            .configure_idmap(&self.settings.name, uid, gid)
            .await?;
        self.backend
            .mount_source(&self.settings.name, &self.settings.source_dir)
            .await?;

        self.state = EnvState::Configured;
        Ok(())
    }

    pub async fn start(&mut self) -> HarnessResult<()> {
        self.expect_state(EnvState::Configured, "start")?;
        self.backend.start(&self.settings.name).await?;
        self.state = EnvState::Started;
        Ok(())
    }

    /// Stop-then-delete, each step best-effort: exceptions are logged and
    /// swallowed, never propagated. Environment state can be dirty at any
    /// point; cleanup is always re-attempted before it is trusted.
    pub async fn teardown(&mut self) {
        match self
            .backend
            .stop(&self.settings.name, true, self.settings.stop_timeout)
            .await
        {
            Ok(()) => self.state = EnvState::Stopped,
            Err(e) => debug!("container stop failed (ignored): {}", e),
        }

        match self.backend.delete(&self.settings.name).await {
            Ok(()) => self.state = EnvState::Deleted,
            Err(e) => debug!("container delete failed (ignored): {}", e),
        }
    }

    /// One-time host preparation for containerized runs; delegated to the
    /// backend since it is runtime-specific.
    pub async fn prepare_host(&self) -> HarnessResult<()> {
        self.backend.prepare_host().await
    }

    /// Execute a command inside the environment.
    pub async fn exec(&self, invocation: &Invocation) -> HarnessResult<String> {
        self.backend.exec(&self.settings.name, invocation).await
    }

    /// Run an in-container command on its own task, for workloads that
    /// block until killed. The returned handle is tracked by the caller.
    pub fn exec_detached(&self, invocation: Invocation) -> tokio::task::JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let name = self.settings.name.clone();
        tokio::spawn(async move {
            // The worker blocks until it is reaped; the eventual error
            // from its kill is expected noise.
            if let Err(e) = backend.exec(&name, &invocation).await {
                debug!("detached worker exec finished: {}", e);
            }
        })
    }

    fn expect_state(&self, expected: EnvState, operation: &str) -> HarnessResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HarnessError::ContainerState {
                state: self.state.to_string(),
                operation: operation.to_string(),
            })
        }
    }
}

async fn ensure_subid_lines(invoker: &RunInvoker, file: &str, id: u32) -> HarnessResult<()> {
    let contents = std::fs::read_to_string(file).unwrap_or_default();

    for owner in ["lxd", "root"] {
        let line = format!("{}:{}:1", owner, id);
        if contents.lines().any(|l| l.trim() == line) {
            continue;
        }
        invoker
            .run(&Invocation::shell(format!(
                "sudo sh -c \"echo {} >> {}\"",
                line, file
            )))
            .await?;
    }
    Ok(())
}

/// Real backend speaking to LXC/LXD through the command-line client.
pub struct LxcBackend {
    invoker: RunInvoker,
    privileged: bool,
}

impl LxcBackend {
    pub fn new(invoker: RunInvoker) -> Self {
        Self {
            invoker,
            privileged: true,
        }
    }

    fn lxc(&self, args: &[&str]) -> Invocation {
        let mut parts: Vec<String> = Vec::with_capacity(args.len() + 2);
        if self.privileged {
            parts.push("sudo".to_string());
        }
        parts.push("lxc".to_string());
        parts.extend(args.iter().map(|s| s.to_string()));
        Invocation::Argv(parts)
    }
}

#[async_trait]
impl ContainerBackend for LxcBackend {
    /// Initialize the LXD daemon and make sure the invoking user's
    /// UID/GID appear in the host's subordinate id files, so bind-mounted
    /// files stay writable from inside.
    async fn prepare_host(&self) -> HarnessResult<()> {
        self.invoker
            .run(&Invocation::argv(["sudo", "lxd", "init", "--auto"]))
            .await?;

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        ensure_subid_lines(&self.invoker, "/etc/subuid", uid).await?;
        ensure_subid_lines(&self.invoker, "/etc/subgid", gid).await?;
        Ok(())
    }

    async fn init(&self, name: &str, image: &str) -> HarnessResult<()> {
        self.invoker.run(&self.lxc(&["init", image, name])).await?;
        Ok(())
    }

    async fn configure_idmap(&self, name: &str, uid: u32, gid: u32) -> HarnessResult<()> {
        // Piped through the shell; `lxc config set` reads the map on stdin.
        let line = format!(
            "printf \"uid {} 1000\\ngid {} 1000\" | sudo lxc config set {} raw.idmap -",
            uid, gid, name
        );
        self.invoker.run(&Invocation::shell(line)).await?;
        Ok(())
    }

    async fn mount_source(&self, name: &str, source: &std::path::Path) -> HarnessResult<()> {
        // Mount the source at the same path as it was built so coverage
        // data generated inside the container lands in the host tree.
        let source = source.display().to_string();
        let src_arg = format!("source={}", source);
        let path_arg = format!("path={}", source);
        self.invoker
            .run(&self.lxc(&[
                "config", "device", "add", name, "cgsrc", "disk", &src_arg, &path_arg,
            ]))
            .await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> HarnessResult<()> {
        self.invoker.run(&self.lxc(&["start", name])).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, force: bool, timeout_secs: u64) -> HarnessResult<()> {
        let timeout = timeout_secs.to_string();
        let invocation = if force {
            self.lxc(&["stop", name, "-f"])
        } else {
            self.lxc(&["stop", name, "--timeout", &timeout])
        };
        self.invoker.run(&invocation).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> HarnessResult<()> {
        self.invoker.run(&self.lxc(&["delete", name])).await?;
        Ok(())
    }

    async fn exec(&self, name: &str, invocation: &Invocation) -> HarnessResult<String> {
        let mut parts: Vec<String> = Vec::new();
        if self.privileged {
            parts.push("sudo".to_string());
        }
        parts.extend(["lxc", "exec", name, "--"].map(str::to_string));

        match invocation {
            Invocation::Argv(inner) => parts.extend(inner.iter().cloned()),
            Invocation::Shell(line) => {
                parts.extend(["/bin/sh", "-c"].map(str::to_string));
                parts.push(line.clone());
            }
        }

        self.invoker.run(&Invocation::Argv(parts)).await
    }
}
