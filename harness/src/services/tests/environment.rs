//! Tests for the environment state machine and provisioning retry,
//! driven against a mock backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use mockall::Sequence;

use crate::error::HarnessError;
use crate::services::environment::{EnvState, Environment, EnvironmentSettings};
use crate::traits::MockContainerBackend;

fn settings() -> EnvironmentSettings {
    EnvironmentSettings {
        name: "TestLibcg".to_string(),
        distro: "ubuntu".to_string(),
        release: "18.04".to_string(),
        arch: "amd64".to_string(),
        stop_timeout: 5,
        source_dir: PathBuf::from("/tmp/src"),
        retry_budget: 5,
        attempt_timeout: Duration::from_millis(200),
        progress_interval: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn create_succeeds_first_try_without_cleanup() {
    let mut backend = MockContainerBackend::new();
    backend
        .expect_init()
        .times(1)
        .withf(|name, image| name == "TestLibcg" && image == "ubuntu:18.04")
        .returning(|_, _| Ok(()));
    backend.expect_delete().times(0);

    let mut env = Environment::new(settings(), Arc::new(backend));
    env.create().await.unwrap();

    assert_eq!(env.state(), EnvState::Created);
    assert_eq!(env.provision_attempts(), 1);
}

#[tokio::test]
async fn create_retries_until_the_backend_recovers() {
    let mut seq = Sequence::new();
    let mut backend = MockContainerBackend::new();
    backend
        .expect_init()
        .times(2)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(HarnessError::config("backend flake")));
    backend
        .expect_init()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    // Each failed attempt cleans up the partial container.
    backend.expect_delete().times(2).returning(|_| Ok(()));

    let mut env = Environment::new(settings(), Arc::new(backend));
    env.create().await.unwrap();

    assert_eq!(env.state(), EnvState::Created);
    assert_eq!(env.provision_attempts(), 3);
}

#[tokio::test]
async fn create_gives_up_after_the_retry_budget() {
    let mut backend = MockContainerBackend::new();
    backend
        .expect_init()
        .times(5)
        .returning(|_, _| Err(HarnessError::config("backend down")));
    backend.expect_delete().times(5).returning(|_| Ok(()));

    let mut env = Environment::new(settings(), Arc::new(backend));
    let err = env.create().await.unwrap_err();

    assert_matches!(err, HarnessError::ContainerProvisioning { attempts: 5, ref message } => {
        assert!(message.contains("backend down"));
    });
    assert_eq!(env.provision_attempts(), 5);
    assert_eq!(env.state(), EnvState::Uninitialized);
}

#[tokio::test]
async fn create_tolerates_a_failing_cleanup_between_attempts() {
    let mut seq = Sequence::new();
    let mut backend = MockContainerBackend::new();
    backend
        .expect_init()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(HarnessError::config("flake")));
    backend
        .expect_init()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    backend
        .expect_delete()
        .times(1)
        .returning(|_| Err(HarnessError::config("nothing to delete")));

    let mut env = Environment::new(settings(), Arc::new(backend));
    env.create().await.unwrap();
    assert_eq!(env.provision_attempts(), 2);
}

#[tokio::test]
async fn lifecycle_walks_created_configured_started() {
    let mut backend = MockContainerBackend::new();
    backend.expect_init().times(1).returning(|_, _| Ok(()));
    backend
        .expect_configure_idmap()
        .times(1)
        .returning(|_, _, _| Ok(()));
    backend
        .expect_mount_source()
        .times(1)
        .withf(|_, source| source == std::path::Path::new("/tmp/src"))
        .returning(|_, _| Ok(()));
    backend.expect_start().times(1).returning(|_| Ok(()));

    let mut env = Environment::new(settings(), Arc::new(backend));
    env.create().await.unwrap();
    env.configure().await.unwrap();
    assert_eq!(env.state(), EnvState::Configured);
    env.start().await.unwrap();
    assert_eq!(env.state(), EnvState::Started);
}

#[tokio::test]
async fn configure_rejects_an_unprovisioned_environment() {
    let backend = MockContainerBackend::new();
    let mut env = Environment::new(settings(), Arc::new(backend));

    let err = env.configure().await.unwrap_err();
    assert_matches!(err, HarnessError::ContainerState { ref state, ref operation } => {
        assert_eq!(state, "uninitialized");
        assert_eq!(operation, "configure");
    });
}

#[tokio::test]
async fn teardown_swallows_backend_failures() {
    let mut backend = MockContainerBackend::new();
    backend
        .expect_stop()
        .times(1)
        .withf(|_, force, timeout| *force && *timeout == 5)
        .returning(|_, _, _| Err(HarnessError::config("already stopped")));
    backend.expect_delete().times(1).returning(|_| Ok(()));

    let mut env = Environment::new(settings(), Arc::new(backend));
    env.teardown().await;

    // The stop failure is ignored; the delete still happened.
    assert_eq!(env.state(), EnvState::Deleted);
}

#[tokio::test]
async fn exec_delegates_to_the_backend() {
    let mut backend = MockContainerBackend::new();
    backend
        .expect_exec()
        .times(1)
        .returning(|_, _| Ok("out".to_string()));

    let env = Environment::new(settings(), Arc::new(backend));
    let out = env
        .exec(&crate::services::invoker::Invocation::argv(["true"]))
        .await
        .unwrap();
    assert_eq!(out, "out");
}
