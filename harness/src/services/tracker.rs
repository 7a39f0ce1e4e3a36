//! Cross-boundary worker lifecycle
//!
//! Spawns worker workloads on the host or inside the container, resolves
//! their PIDs, and guarantees their termination. On the host the owned
//! child handle is the identifier source; across the container boundary
//! the worker publishes its own PID to a per-spawn token file before
//! blocking, and the tracker polls that file with a settle timeout.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cgroup::Cgroup;
use crate::config::Config;
use crate::error::{HarnessError, HarnessResult};
use crate::services::environment::Environment;
use crate::services::invoker::Invocation;

const PID_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const PID_POLL_INTERVAL: Duration = Duration::from_millis(200);
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Either an owned child process or the task wrapping a blocking
/// in-container exec.
enum WorkerHandle {
    Host(Child),
    Detached(JoinHandle<()>),
}

/// A bare identifier, possibly living inside the container's PID
/// namespace.
#[derive(Debug, Clone, Copy)]
struct WorkerPid {
    pid: i32,
    in_container: bool,
}

/// Tracks every worker fixture spawned during a run.
///
/// Membership is added at spawn time and removed, best-effort, by
/// [`ProcessTracker::reap`]; reaping is invoked explicitly by each unit's
/// teardown and by the end-of-run cleanup, never automatically.
pub struct ProcessTracker {
    handles: Mutex<Vec<WorkerHandle>>,
    pids: Mutex<Vec<WorkerPid>>,
    /// Monotonic over the tracker's whole life, so token paths are never
    /// reused even after a reap drains the handle table.
    spawn_counter: AtomicU64,
    worker_bin: PathBuf,
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            pids: Mutex::new(Vec::new()),
            spawn_counter: AtomicU64::new(0),
            worker_bin: default_worker_bin(),
        }
    }

    /// Override the worker binary (tests substitute a stub script).
    pub fn with_worker_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_bin = path.into();
        self
    }

    /// Raw PIDs currently tracked.
    pub async fn tracked_pids(&self) -> Vec<i32> {
        self.pids.lock().await.iter().map(|w| w.pid).collect()
    }

    /// Start a generic long-running worker and return its PID. Placement
    /// into a cgroup is a separate, explicit step.
    pub async fn spawn_workload(&self, config: &Config) -> HarnessResult<i32> {
        self.spawn(config, &[], 0).await
    }

    /// Spawn-then-place: start a worker, then move it into the target
    /// cgroup via an explicit classify.
    pub async fn spawn_workload_in_cgroup(
        &self,
        config: &Config,
        controller: &str,
        cgname: &str,
    ) -> HarnessResult<i32> {
        let pid = self.spawn_workload(config).await?;
        Cgroup::classify(config, controller, cgname, &[pid]).await?;
        Ok(pid)
    }

    /// Exec-in-place: start the worker already inside the target cgroup
    /// via cgexec. With `replace_idle`, the placeholder PIDs that were in
    /// the group before the spawn are killed afterwards.
    pub async fn exec_in_cgroup(
        &self,
        config: &Config,
        controller: &str,
        cgname: &str,
        replace_idle: bool,
    ) -> HarnessResult<i32> {
        let idle = if replace_idle {
            Cgroup::pids_in_cgroup(config, cgname, controller)
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let prefix = Cgroup::exec_prefix(config, controller, cgname);
        let pid = self.spawn(config, &prefix, 0).await?;

        for placeholder in idle {
            self.kill_one(
                config.environment.as_ref(),
                WorkerPid {
                    pid: placeholder,
                    in_container: config.in_container(),
                },
            )
            .await;
        }

        Ok(pid)
    }

    /// Start one worker process containing `threads` sleeping threads and
    /// place the owning process into the target cgroup. Individual thread
    /// IDs are discovered by tests through cgroup.threads, not here.
    pub async fn spawn_threaded_in_cgroup(
        &self,
        config: &Config,
        controller: &str,
        cgname: &str,
        threads: usize,
    ) -> HarnessResult<i32> {
        let pid = self.spawn(config, &[], threads).await?;
        Cgroup::classify(config, controller, cgname, &[pid]).await?;
        Ok(pid)
    }

    async fn spawn(
        &self,
        config: &Config,
        prefix: &[String],
        threads: usize,
    ) -> HarnessResult<i32> {
        match &config.environment {
            Some(environment) => self.spawn_in_container(environment, prefix, threads).await,
            None => self.spawn_on_host(prefix, threads).await,
        }
    }

    async fn spawn_on_host(&self, prefix: &[String], threads: usize) -> HarnessResult<i32> {
        let mut argv: Vec<String> = prefix.to_vec();
        argv.push(self.worker_bin.display().to_string());
        argv.extend(["--interval".to_string(), "1".to_string()]);
        if threads > 0 {
            argv.extend(["--threads".to_string(), threads.to_string()]);
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| HarnessError::WorkerSpawn {
            message: format!("failed to spawn '{}': {}", argv.join(" "), e),
        })?;

        let pid = child.id().ok_or_else(|| HarnessError::WorkerSpawn {
            message: "worker exited before its PID could be read".to_string(),
        })? as i32;

        debug!("spawned host worker (PID {})", pid);
        self.handles.lock().await.push(WorkerHandle::Host(child));
        self.pids.lock().await.push(WorkerPid {
            pid,
            in_container: false,
        });
        Ok(pid)
    }

    async fn spawn_in_container(
        &self,
        environment: &Environment,
        prefix: &[String],
        threads: usize,
    ) -> HarnessResult<i32> {
        // A unique token per spawn; the worker writes its PID there
        // before its first sleep.
        let token = format!(
            "/tmp/workload-{}.pid",
            self.spawn_counter.fetch_add(1, Ordering::Relaxed) + 1
        );

        // A previous run may have left a stale file at this path; it must
        // not satisfy the handoff poll before the new worker writes.
        let _ = environment
            .exec(&Invocation::argv(["rm", "-f", &token]))
            .await;

        let mut argv: Vec<String> = prefix.to_vec();
        argv.push(self.worker_bin.display().to_string());
        argv.extend([
            "--pid-file".to_string(),
            token.clone(),
            "--interval".to_string(),
            "1".to_string(),
        ]);
        if threads > 0 {
            argv.extend(["--threads".to_string(), threads.to_string()]);
        }

        // The exec blocks for the worker's whole life; park it on a task.
        let handle = environment.exec_detached(Invocation::Argv(argv));
        self.handles
            .lock()
            .await
            .push(WorkerHandle::Detached(handle));

        let pid = self.resolve_pid(environment, &token).await?;
        debug!("spawned container worker (PID {})", pid);
        self.pids.lock().await.push(WorkerPid {
            pid,
            in_container: true,
        });
        Ok(pid)
    }

    /// Resolve a spawn token to the worker's PID as seen inside the
    /// container.
    async fn resolve_pid(&self, environment: &Environment, token: &str) -> HarnessResult<i32> {
        let deadline = tokio::time::Instant::now() + PID_SETTLE_TIMEOUT;

        loop {
            let read = environment
                .exec(&Invocation::argv(["cat", token]))
                .await;

            if let Ok(contents) = read {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    if pid > 0 {
                        return Ok(pid);
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(HarnessError::PidHandoff {
                    token: token.to_string(),
                    message: format!("worker did not publish a PID within {:?}", PID_SETTLE_TIMEOUT),
                });
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
    }

    /// Terminate every tracked worker: signal the raw PIDs first (so
    /// blocking in-container execs return), then collect the handles.
    /// "Already gone" is tolerated throughout.
    pub async fn reap(&self, environment: Option<&Environment>) {
        let pids: Vec<WorkerPid> = self.pids.lock().await.drain(..).collect();
        for worker in pids {
            self.kill_one(environment, worker).await;
        }

        let handles: Vec<WorkerHandle> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            match handle {
                WorkerHandle::Host(mut child) => {
                    // Kills if still alive and reaps the zombie.
                    if let Err(e) = child.kill().await {
                        debug!("host worker kill failed (ignored): {}", e);
                    }
                }
                WorkerHandle::Detached(mut task) => {
                    // The kill above normally lets the exec return; abort
                    // covers a worker that never published a PID.
                    if tokio::time::timeout(JOIN_GRACE, &mut task).await.is_err() {
                        task.abort();
                    }
                }
            }
        }
    }

    async fn kill_one(&self, environment: Option<&Environment>, worker: WorkerPid) {
        if worker.in_container {
            if let Some(environment) = environment {
                let kill = Invocation::argv(["kill", &worker.pid.to_string()]);
                if let Err(e) = environment.exec(&kill).await {
                    debug!("container kill of {} failed (ignored): {}", worker.pid, e);
                }
            }
            return;
        }

        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(worker.pid), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => debug!("kill of host PID {} failed (ignored): {}", worker.pid, e),
        }
    }
}

/// The workload binary is built as a sibling of the harness binary; fall
/// back to PATH resolution when that layout does not hold.
fn default_worker_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("workload")))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("workload"))
}
