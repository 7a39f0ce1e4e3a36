//! Tests for host-side worker tracking and reaping.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::config::{Config, RunOptions};
use crate::services::environment::{Environment, EnvironmentSettings};
use crate::services::tracker::ProcessTracker;
use crate::traits::MockContainerBackend;

fn host_config() -> Config {
    Config::new(RunOptions {
        container: false,
        ..RunOptions::default()
    })
}

/// A stand-in worker binary that just parks itself.
fn stub_worker(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("workload");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 60\n").unwrap();

    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[tokio::test]
async fn reap_with_nothing_tracked_is_a_no_op() {
    let tracker = ProcessTracker::new();
    tracker.reap(None).await;
    assert!(tracker.tracked_pids().await.is_empty());
}

#[tokio::test]
async fn spawned_host_workers_are_tracked() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = ProcessTracker::new().with_worker_bin(stub_worker(&dir));
    let config = host_config();

    let pid = tracker.spawn_workload(&config).await.unwrap();
    assert!(pid > 0);
    assert_eq!(tracker.tracked_pids().await, vec![pid]);

    // Alive until reaped.
    assert!(kill(Pid::from_raw(pid), None).is_ok());
    tracker.reap(None).await;
}

#[tokio::test]
async fn reap_terminates_host_workers_and_clears_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = ProcessTracker::new().with_worker_bin(stub_worker(&dir));
    let config = host_config();

    let first = tracker.spawn_workload(&config).await.unwrap();
    let second = tracker.spawn_workload(&config).await.unwrap();
    assert_ne!(first, second);

    tracker.reap(None).await;
    assert!(tracker.tracked_pids().await.is_empty());

    for pid in [first, second] {
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    }
}

#[tokio::test]
async fn reap_tolerates_a_worker_that_already_exited() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = ProcessTracker::new().with_worker_bin(stub_worker(&dir));
    let config = host_config();

    let pid = tracker.spawn_workload(&config).await.unwrap();
    kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The second kill inside reap sees ESRCH and moves on.
    tracker.reap(None).await;
    assert!(tracker.tracked_pids().await.is_empty());
}

fn container_settings() -> EnvironmentSettings {
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

#[tokio::test]
async fn container_spawn_tokens_are_never_reused_after_a_reap() {
    let lines = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));

    let mut backend = MockContainerBackend::new();
    let seen = Arc::clone(&lines);
    backend.expect_exec().returning(move |_, invocation| {
        let line = invocation.rendered();
        seen.lock().unwrap().push(line.clone());
        if line.starts_with("cat ") {
            Ok("4242".to_string())
        } else {
            Ok(String::new())
        }
    });

    let env = Environment::new(container_settings(), Arc::new(backend));
    let config = Config::new(RunOptions {
        container: false,
        ..RunOptions::default()
    })
    .with_environment(Some(env));

    let tracker = ProcessTracker::new();
    tracker.spawn_workload(&config).await.unwrap();
    tracker.reap(config.environment.as_ref()).await;
    tracker.spawn_workload(&config).await.unwrap();

    let lines = lines.lock().unwrap().clone();
    let tokens: Vec<&str> = lines
        .iter()
        .filter(|line| line.starts_with("cat "))
        .map(|line| line.trim_start_matches("cat "))
        .collect();

    // One handoff poll per spawn, against two distinct token paths.
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1]);

    // Each spawn clears any stale file before its first poll.
    for token in tokens {
        let rm = format!("rm -f {}", token);
        let rm_at = lines.iter().position(|l| l == &rm).unwrap();
        let cat_at = lines
            .iter()
            .position(|l| l == &format!("cat {}", token))
            .unwrap();
        assert!(rm_at < cat_at);
    }
}

#[tokio::test]
async fn spawn_fails_cleanly_when_the_worker_binary_is_missing() {
    let tracker = ProcessTracker::new().with_worker_bin("/nonexistent/workload");
    let config = host_config();

    // Shell-less spawn surfaces the missing binary immediately.
    assert!(tracker.spawn_workload(&config).await.is_err());
    assert!(tracker.tracked_pids().await.is_empty());
}
