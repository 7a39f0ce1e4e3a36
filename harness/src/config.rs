//! Process-wide, run-scoped configuration
//!
//! `Config` is the explicit context object threaded through every call:
//! parsed run options, the selection filters, the optional container
//! environment, and the worker tracker. There is no module-level mutable
//! state anywhere in the harness.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::HarnessResult;
use crate::services::environment::{Environment, EnvironmentSettings, LxcBackend};
use crate::services::invoker::{Invocation, RunInvoker};
use crate::services::tracker::ProcessTracker;

pub const DEFAULT_CONTAINER_NAME: &str = "TestLibcg";
pub const DEFAULT_CONTAINER_DISTRO: &str = "ubuntu";
pub const DEFAULT_CONTAINER_RELEASE: &str = "18.04";
pub const DEFAULT_CONTAINER_ARCH: &str = "amd64";
pub const DEFAULT_CONTAINER_STOP_TIMEOUT: u64 = 5;

/// A single-axis selection filter: everything, or exactly one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter<T> {
    All,
    Only(T),
}

impl<T: PartialEq> Filter<T> {
    pub fn matches(&self, candidate: &T) -> bool {
        match self {
            Filter::All => true,
            Filter::Only(value) => value == candidate,
        }
    }
}

/// Parsed run options for one harness invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run the tests inside an ephemeral container.
    pub container: bool,
    pub container_name: String,
    pub distro: String,
    pub release: String,
    pub arch: String,
    /// Wait timeout (sec) before force-stopping the container.
    pub stop_timeout: u64,

    /// Ordinal filter (`-N`).
    pub num: Filter<u32>,
    /// Suite filter (`-s`).
    pub suite: Filter<String>,
    /// Ordinals excluded unconditionally (`-S`).
    pub skip: HashSet<u32>,

    pub verbose: bool,

    /// Directory scanned for test unit descriptors.
    pub ftest_dir: PathBuf,
    /// Root of the source tree, bind-mounted into the container at the
    /// identical path.
    pub source_dir: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        let ftest_dir = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/catalog"));
        let source_dir = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            container: true,
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            distro: DEFAULT_CONTAINER_DISTRO.to_string(),
            release: DEFAULT_CONTAINER_RELEASE.to_string(),
            arch: DEFAULT_CONTAINER_ARCH.to_string(),
            stop_timeout: DEFAULT_CONTAINER_STOP_TIMEOUT,
            num: Filter::All,
            suite: Filter::All,
            skip: HashSet::new(),
            verbose: true,
            ftest_dir,
            source_dir,
        }
    }
}

/// Filter state consulted once per discovered unit.
#[derive(Debug, Clone)]
pub struct RunSelection {
    pub suite: Filter<String>,
    pub num: Filter<u32>,
    pub skip: HashSet<u32>,
}

impl RunSelection {
    pub fn from_options(options: &RunOptions) -> Self {
        Self {
            suite: options.suite.clone(),
            num: options.num.clone(),
            skip: options.skip.clone(),
        }
    }

    /// Skip-set exclusion is unconditional, independent of the suite and
    /// ordinal filters.
    pub fn selects(&self, num: u32, suite: &str) -> bool {
        if self.skip.contains(&num) {
            return false;
        }
        self.suite.matches(&suite.to_string()) && self.num.matches(&num)
    }
}

/// Run-scoped aggregate owning the environment handle and the tracker.
///
/// Constructed before any unit executes, torn down after the last one.
pub struct Config {
    pub options: RunOptions,
    pub selection: RunSelection,
    pub invoker: RunInvoker,
    /// At most one live environment per run; `None` in host mode.
    pub environment: Option<Environment>,
    pub tracker: ProcessTracker,
}

impl Config {
    pub fn new(options: RunOptions) -> Self {
        let selection = RunSelection::from_options(&options);
        let environment = options.container.then(|| {
            Environment::new(
                EnvironmentSettings::from_options(&options),
                Arc::new(LxcBackend::new(RunInvoker::new())),
            )
        });

        Self {
            options,
            selection,
            invoker: RunInvoker::new(),
            environment,
            tracker: ProcessTracker::new(),
        }
    }

    /// Replace the environment, e.g. with one backed by a mock backend.
    pub fn with_environment(mut self, environment: Option<Environment>) -> Self {
        self.environment = environment;
        self
    }

    pub fn in_container(&self) -> bool {
        self.environment.is_some()
    }

    /// Execute a command in the run's execution context: inside the
    /// container when one is configured, on the host otherwise.
    pub async fn run(&self, invocation: &Invocation) -> HarnessResult<String> {
        match &self.environment {
            Some(environment) => environment.exec(invocation).await,
            None => self.invoker.run(invocation).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_matches_suite_and_num() {
        let selection = RunSelection {
            suite: Filter::Only("cpu".to_string()),
            num: Filter::All,
            skip: HashSet::new(),
        };

        assert!(selection.selects(1, "cpu"));
        assert!(!selection.selects(1, "cpuset"));
    }

    #[test]
    fn skip_set_wins_over_matching_filters() {
        let selection = RunSelection {
            suite: Filter::Only("cpuset".to_string()),
            num: Filter::Only(5),
            skip: [5].into_iter().collect(),
        };

        assert!(!selection.selects(5, "cpuset"));
    }

    #[test]
    fn number_filter_is_suite_independent() {
        let selection = RunSelection {
            suite: Filter::All,
            num: Filter::Only(12),
            skip: HashSet::new(),
        };

        assert!(selection.selects(12, "cpu"));
        assert!(selection.selects(12, "memory"));
        assert!(!selection.selects(13, "cpu"));
    }

    #[test]
    fn host_mode_config_has_no_environment() {
        let config = Config::new(RunOptions {
            container: false,
            ..RunOptions::default()
        });

        assert!(!config.in_container());
    }
}
