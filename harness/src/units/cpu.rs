//! Units exercising the cpu controller.

use async_trait::async_trait;

use crate::cgroup::{Cgroup, CgroupVersion, Setting};
use crate::config::Config;
use crate::error::{HarnessError, HarnessResult};
use crate::services::invoker::Invocation;
use crate::traits::{Conclusion, TestCase, Verdict};

const CONTROLLER: &str = "cpu";

/// The writable cpu weight knob differs between hierarchy generations.
fn weight_knob() -> HarnessResult<(&'static str, &'static str)> {
    match Cgroup::version(CONTROLLER)? {
        CgroupVersion::V1 => Ok(("cpu.shares", "512")),
        CgroupVersion::V2 => Ok(("cpu.weight", "512")),
        CgroupVersion::Unknown => Err(HarnessError::config(
            "cpu controller is not mounted".to_string(),
        )),
    }
}

fn require_cpu() -> HarnessResult<Verdict> {
    if Cgroup::version(CONTROLLER)? == CgroupVersion::Unknown {
        return Ok(Verdict::Skip(
            "cpu controller is not mounted here".to_string(),
        ));
    }
    Ok(Verdict::Ready)
}

/// Set a cpu weight and read it straight back through cgget.
pub struct BasicRead;

#[async_trait]
impl TestCase for BasicRead {
    fn file(&self) -> &'static str {
        "001-cpu-basic_read"
    }

    async fn prereqs(&self, _config: &Config) -> HarnessResult<Verdict> {
        require_cpu()
    }

    async fn setup(&self, config: &Config) -> HarnessResult<()> {
        Cgroup::create(config, &[CONTROLLER], "001cgget").await
    }

    async fn test(&self, config: &Config) -> HarnessResult<Conclusion> {
        let (name, value) = weight_knob()?;

        Cgroup::set(config, "001cgget", &Setting::one(name, value)).await?;
        let actual = Cgroup::get_value(config, "001cgget", name).await?;

        if actual == value {
            Ok(Conclusion::Pass)
        } else {
            Ok(Conclusion::Fail(format!(
                "{} was set to {} but reads back as {}",
                name, value, actual
            )))
        }
    }

    async fn teardown(&self, config: &Config) -> HarnessResult<()> {
        Cgroup::delete(config, &[CONTROLLER], "001cgget", false).await
    }
}

/// Recursively delete a nested hierarchy and verify it is really gone.
pub struct NestedDelete;

#[async_trait]
impl TestCase for NestedDelete {
    fn file(&self) -> &'static str {
        "002-cpu-nested_delete"
    }

    async fn prereqs(&self, _config: &Config) -> HarnessResult<Verdict> {
        require_cpu()
    }

    async fn setup(&self, config: &Config) -> HarnessResult<()> {
        Cgroup::create(config, &[CONTROLLER], "002delete").await?;
        Cgroup::create(config, &[CONTROLLER], "002delete/nested").await
    }

    async fn test(&self, config: &Config) -> HarnessResult<Conclusion> {
        let (name, _) = weight_knob()?;

        Cgroup::delete(config, &[CONTROLLER], "002delete", true).await?;

        match Cgroup::get_value(config, "002delete/nested", name).await {
            Err(HarnessError::Run { .. }) => Ok(Conclusion::Pass),
            Err(other) => Err(other),
            Ok(value) => Ok(Conclusion::Fail(format!(
                "002delete/nested still readable after recursive delete ({} = {})",
                name, value
            ))),
        }
    }

    async fn teardown(&self, config: &Config) -> HarnessResult<()> {
        // The hierarchy is normally gone by now.
        let _ = Cgroup::delete(config, &[CONTROLLER], "002delete", true).await;
        Ok(())
    }
}

/// Move a running worker into a cgroup with cgclassify and verify its
/// membership through cgroup.procs.
pub struct ClassifyWorkload;

#[async_trait]
impl TestCase for ClassifyWorkload {
    fn file(&self) -> &'static str {
        "012-cpu-classify_workload"
    }

    async fn prereqs(&self, _config: &Config) -> HarnessResult<Verdict> {
        require_cpu()
    }

    async fn setup(&self, config: &Config) -> HarnessResult<()> {
        Cgroup::create(config, &[CONTROLLER], "012classify").await
    }

    async fn test(&self, config: &Config) -> HarnessResult<Conclusion> {
        let pid = config
            .tracker
            .spawn_workload_in_cgroup(config, CONTROLLER, "012classify")
            .await?;

        let members = Cgroup::pids_in_cgroup(config, "012classify", CONTROLLER).await?;
        if !members.contains(&pid) {
            return Ok(Conclusion::Fail(format!(
                "pid {} is not in 012classify after cgclassify (members: {:?})",
                pid, members
            )));
        }

        // Cross-check against the worker's own view of its membership.
        if !config.in_container() {
            let lines = Cgroup::proc_cgroups(pid)?;
            if !lines.iter().any(|line| line.contains("012classify")) {
                return Ok(Conclusion::Fail(format!(
                    "/proc/{}/cgroup does not mention 012classify: {:?}",
                    pid, lines
                )));
            }
        }

        Ok(Conclusion::Pass)
    }

    async fn teardown(&self, config: &Config) -> HarnessResult<()> {
        config.tracker.reap(config.environment.as_ref()).await;
        Cgroup::delete(config, &[CONTROLLER], "012classify", false).await
    }
}

/// Thread-granularity placement: mark a child cgroup threaded, then move
/// one thread of a multithreaded worker into it.
pub struct ThreadedMembership;

const PARENT: &str = "036threaded";
const CHILD: &str = "036threaded/child";
const WORKER_THREADS: usize = 3;

#[async_trait]
impl TestCase for ThreadedMembership {
    fn file(&self) -> &'static str {
        "036-cpu-threaded_membership"
    }

    async fn prereqs(&self, config: &Config) -> HarnessResult<Verdict> {
        if config.in_container() {
            return Ok(Verdict::Skip(
                "Test cannot be run within a container".to_string(),
            ));
        }
        match Cgroup::version(CONTROLLER)? {
            CgroupVersion::V2 => Ok(Verdict::Ready),
            _ => Ok(Verdict::Skip(
                "thread mode requires the unified cpu hierarchy".to_string(),
            )),
        }
    }

    async fn setup(&self, config: &Config) -> HarnessResult<()> {
        Cgroup::create(config, &[CONTROLLER], PARENT).await?;
        Cgroup::create(config, &[CONTROLLER], CHILD).await?;
        Cgroup::set_and_validate(config, CHILD, "cgroup.type", "threaded").await
    }

    async fn test(&self, config: &Config) -> HarnessResult<Conclusion> {
        let pid = config
            .tracker
            .spawn_threaded_in_cgroup(config, CONTROLLER, PARENT, WORKER_THREADS)
            .await?;

        let threads = Cgroup::threads_in_cgroup(config, PARENT, CONTROLLER).await?;
        if threads.len() < WORKER_THREADS + 1 {
            return Ok(Conclusion::Fail(format!(
                "expected at least {} threads in {}, found {:?}",
                WORKER_THREADS + 1,
                PARENT,
                threads
            )));
        }

        let Some(&tid) = threads.iter().find(|&&t| t != pid) else {
            return Ok(Conclusion::Fail(
                "no worker thread distinct from the main thread".to_string(),
            ));
        };

        let mount = Cgroup::mount_point(CONTROLLER)?.ok_or_else(|| {
            HarnessError::config("cpu controller is not mounted".to_string())
        })?;
        config
            .run(&Invocation::shell(format!(
                "echo {} > {}",
                tid,
                mount.join(CHILD).join("cgroup.threads").display()
            )))
            .await?;

        let moved = Cgroup::threads_in_cgroup(config, CHILD, CONTROLLER).await?;
        if moved.contains(&tid) {
            Ok(Conclusion::Pass)
        } else {
            Ok(Conclusion::Fail(format!(
                "tid {} did not land in {} (members: {:?})",
                tid, CHILD, moved
            )))
        }
    }

    async fn teardown(&self, config: &Config) -> HarnessResult<()> {
        config.tracker.reap(config.environment.as_ref()).await;
        Cgroup::delete(config, &[CONTROLLER], PARENT, true).await
    }
}
