//! Shared fixtures for the lifecycle integration tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use harness::config::{Config, RunOptions};
use harness::error::{HarnessError, HarnessResult};
use harness::traits::{Conclusion, MockContainerBackend, TestCase, Verdict};
use harness::EnvironmentSettings;

/// What the scripted case should do when its phases run.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Pass,
    FailTest,
    ErrTest,
    PanicTest,
    ErrSetup,
    SkipPrereq,
}

/// Chronological record of every phase entered, shared across cases.
pub type PhaseLog = Arc<Mutex<Vec<String>>>;

pub fn phase_log() -> PhaseLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Test case that follows a script and records which phases ran.
pub struct ScriptedCase {
    file: &'static str,
    behavior: Behavior,
    log: PhaseLog,
}

impl ScriptedCase {
    pub fn new(file: &'static str, behavior: Behavior, log: PhaseLog) -> Self {
        Self {
            file,
            behavior,
            log,
        }
    }

    fn record(&self, phase: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.file, phase));
    }
}

#[async_trait]
impl TestCase for ScriptedCase {
    fn file(&self) -> &'static str {
        self.file
    }

    async fn prereqs(&self, _config: &Config) -> HarnessResult<Verdict> {
        self.record("prereqs");
        match self.behavior {
            Behavior::SkipPrereq => Ok(Verdict::Skip("not supported here".to_string())),
            _ => Ok(Verdict::Ready),
        }
    }

    async fn setup(&self, _config: &Config) -> HarnessResult<()> {
        self.record("setup");
        match self.behavior {
            Behavior::ErrSetup => Err(HarnessError::config("fixture unavailable")),
            _ => Ok(()),
        }
    }

    async fn test(&self, _config: &Config) -> HarnessResult<Conclusion> {
        self.record("test");
        match self.behavior {
            Behavior::FailTest => Ok(Conclusion::Fail("value mismatch".to_string())),
            Behavior::ErrTest => Err(HarnessError::config("tool exploded")),
            Behavior::PanicTest => panic!("unexpected state"),
            _ => Ok(Conclusion::Pass),
        }
    }

    async fn teardown(&self, _config: &Config) -> HarnessResult<()> {
        self.record("teardown");
        Ok(())
    }
}

/// Populate a catalog directory with empty descriptor files.
pub fn write_catalog(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), "").unwrap();
    }
}

/// Environment settings with test-sized retry timings.
pub fn mock_settings() -> EnvironmentSettings {
    EnvironmentSettings {
        name: "TestLibcg".to_string(),
        distro: "ubuntu".to_string(),
        release: "18.04".to_string(),
        arch: "amd64".to_string(),
        stop_timeout: 5,
        source_dir: PathBuf::from("/tmp/src"),
        retry_budget: 1,
        attempt_timeout: Duration::from_millis(200),
        progress_interval: Duration::from_millis(50),
    }
}

/// Mock backend that records every operation into the shared log and
/// always succeeds.
pub fn recording_backend(log: &PhaseLog) -> MockContainerBackend {
    let mut backend = MockContainerBackend::new();

    let l = Arc::clone(log);
    backend.expect_prepare_host().returning(move || {
        l.lock().unwrap().push("backend:prepare".to_string());
        Ok(())
    });
    let l = Arc::clone(log);
    backend.expect_init().returning(move |_, _| {
        l.lock().unwrap().push("backend:init".to_string());
        Ok(())
    });
    let l = Arc::clone(log);
    backend.expect_configure_idmap().returning(move |_, _, _| {
        l.lock().unwrap().push("backend:idmap".to_string());
        Ok(())
    });
    let l = Arc::clone(log);
    backend.expect_mount_source().returning(move |_, _| {
        l.lock().unwrap().push("backend:mount".to_string());
        Ok(())
    });
    let l = Arc::clone(log);
    backend.expect_start().returning(move |_| {
        l.lock().unwrap().push("backend:start".to_string());
        Ok(())
    });
    let l = Arc::clone(log);
    backend.expect_stop().returning(move |_, _, _| {
        l.lock().unwrap().push("backend:stop".to_string());
        Ok(())
    });
    let l = Arc::clone(log);
    backend.expect_delete().returning(move |_| {
        l.lock().unwrap().push("backend:delete".to_string());
        Ok(())
    });
    let l = Arc::clone(log);
    backend.expect_exec().returning(move |_, _| {
        l.lock().unwrap().push("backend:exec".to_string());
        Ok(String::new())
    });

    backend
}

/// Host-mode configuration pointed at a throwaway catalog.
pub fn host_config(catalog: &Path) -> Config {
    Config::new(RunOptions {
        container: false,
        ftest_dir: catalog.to_path_buf(),
        ..RunOptions::default()
    })
}
