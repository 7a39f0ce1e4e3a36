//! Functional-test harness for the cgroup command-line tools
//!
//! The library provides the orchestration core: test discovery and
//! selection, the per-unit lifecycle state machine, an ephemeral container
//! environment with retrying provisioning, worker process tracking, and a
//! normalized external-command invoker. The individual tool wrappers in
//! [`cgroup`] are thin argument assemblers on top of that core.

pub mod cgroup;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod services;
pub mod traits;
pub mod units;

// Re-export commonly used types
pub use config::{Config, Filter, RunOptions, RunSelection};
pub use error::{HarnessError, HarnessResult};
pub use orchestrator::{Orchestrator, RunSummary, TestOutcome, TestStatus, TestUnit};
pub use registry::Registry;
pub use services::environment::{Environment, EnvironmentSettings, LxcBackend};
pub use services::invoker::{Invocation, RunInvoker};
pub use services::tracker::ProcessTracker;
pub use traits::{ContainerBackend, TestCase, Verdict};
