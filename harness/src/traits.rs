//! Trait definitions with mockall annotations for testing
//!
//! The injectable seams of the harness: the container backend that
//! provisions the isolated environment, and the per-unit test interface
//! driven by the orchestrator. Both are mockable so the lifecycle and
//! retry machinery can be exercised without a real container runtime.

use std::path::Path;

use crate::config::Config;
use crate::error::HarnessResult;
use crate::services::invoker::Invocation;

/// Outcome of a unit's prerequisite inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Ambient conditions are satisfied, proceed to setup.
    Ready,
    /// The unit cannot run here; carries the human-readable cause.
    Skip(String),
}

/// What a unit's `test` phase concluded when it returned normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conclusion {
    Pass,
    Fail(String),
}

/// Backend that provisions and drives the isolated execution environment.
///
/// The real implementation shells out to the LXC tooling; tests substitute
/// a mock to simulate backend flakiness.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ContainerBackend: Send + Sync {
    /// One-time host preparation: bring the container runtime up and make
    /// sure the invoking user can map ids into containers.
    async fn prepare_host(&self) -> HarnessResult<()>;

    /// Provision a new (stopped) container from the given image.
    async fn init(&self, name: &str, image: &str) -> HarnessResult<()>;

    /// Map the invoking user's UID/GID into the container's id namespace
    /// so files written inside are owned by the invoking user on the host.
    async fn configure_idmap(&self, name: &str, uid: u32, gid: u32) -> HarnessResult<()>;

    /// Bind-mount the source tree read-write at the identical path inside
    /// the container so coverage artifacts line up between host and guest.
    async fn mount_source(&self, name: &str, source: &Path) -> HarnessResult<()>;

    async fn start(&self, name: &str) -> HarnessResult<()>;

    async fn stop(&self, name: &str, force: bool, timeout_secs: u64) -> HarnessResult<()>;

    async fn delete(&self, name: &str) -> HarnessResult<()>;

    /// Execute a command inside the container and return its stdout.
    async fn exec(&self, name: &str, invocation: &Invocation) -> HarnessResult<String>;
}

/// One independently runnable test module.
///
/// The orchestrator drives prereqs -> setup -> test -> teardown in strict
/// order; see `Orchestrator::run_unit` for the full state machine,
/// including the guarantees around teardown and failure recovery.
#[async_trait::async_trait]
pub trait TestCase: Send + Sync {
    /// Canonical source file name, `<ordinal>-<suite>-<description>`.
    fn file(&self) -> &'static str;

    /// Inspect ambient conditions (controller availability, cgroup
    /// version, container vs. host mode) and decide whether to run.
    async fn prereqs(&self, config: &Config) -> HarnessResult<Verdict> {
        let _ = config;
        Ok(Verdict::Ready)
    }

    /// Prepare fixtures. Failures here are errors, not test results.
    async fn setup(&self, config: &Config) -> HarnessResult<()>;

    /// Execute the assertions.
    async fn test(&self, config: &Config) -> HarnessResult<Conclusion>;

    /// Release fixtures. Runs whenever setup was attempted, including
    /// after a failed setup or test; each unit is responsible for reaping
    /// the workers it spawned.
    async fn teardown(&self, config: &Config) -> HarnessResult<()>;
}
