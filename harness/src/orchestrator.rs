//! Test discovery, selection, lifecycle and reporting
//!
//! The orchestrator owns one `Config` for the whole run and drives each
//! selected unit through a fixed prereqs -> setup -> test -> teardown
//! lifecycle. Failures are caught, classified, and fed back into
//! environment recovery before the next unit, so one defective test
//! cannot poison the rest of the run.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::HarnessResult;
use crate::registry::Registry;
use crate::services::invoker::Invocation;
use crate::traits::{Conclusion, TestCase, Verdict};

/// Automake-compatible result codes for the run itself.
pub const EXIT_PASSED: i32 = 0;
pub const EXIT_ALL_SKIPPED: i32 = 77;
pub const EXIT_HARD_ERROR: i32 = 99;

/// One discovered, independently runnable test module. Read-only for the
/// run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
    pub num: u32,
    pub suite: String,
    /// Full source file name, `<ordinal>-<suite>-<description>`.
    pub name: String,
    pub path: std::path::PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

/// Produced exactly once per executed unit.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub unit: String,
    pub status: TestStatus,
    pub cause: Option<String>,
    pub elapsed: Duration,
}

/// Aggregated results of one run, in three ordered buckets.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub passed: Vec<TestOutcome>,
    pub failed: Vec<TestOutcome>,
    pub skipped: Vec<TestOutcome>,
    pub setup_time: Duration,
    pub teardown_time: Duration,
}

impl RunSummary {
    fn record(&mut self, outcome: TestOutcome) {
        match outcome.status {
            TestStatus::Passed => self.passed.push(outcome),
            TestStatus::Failed => self.failed.push(outcome),
            TestStatus::Skipped => self.skipped.push(outcome),
        }
    }

    /// 0 if anything passed and nothing failed, the distinguished skip
    /// code when only skips happened, the hard-error code when nothing
    /// ran, otherwise the failed-unit count.
    pub fn exit_code(&self) -> i32 {
        if !self.failed.is_empty() {
            return self.failed.len() as i32;
        }
        if !self.passed.is_empty() {
            return EXIT_PASSED;
        }
        if !self.skipped.is_empty() {
            return EXIT_ALL_SKIPPED;
        }
        EXIT_HARD_ERROR
    }

    /// Per-run summary: counts, one line per failure, and with `verbose`
    /// the per-unit timing table.
    pub fn print_report(&self, verbose: bool) {
        println!("-----------------------------------------------------------------");
        println!("Test Results:");

        let date = chrono::Local::now().format("%b %d %H:%M:%S");
        println!("\t{:<35}{:>15}", "Run Date:", date.to_string());
        println!(
            "\t{:<35}{:>15}",
            "Passed:",
            format!("{} test(s)", self.passed.len())
        );
        println!(
            "\t{:<35}{:>15}",
            "Skipped:",
            format!("{} test(s)", self.skipped.len())
        );
        println!(
            "\t{:<35}{:>15}",
            "Failed:",
            format!("{} test(s)", self.failed.len())
        );

        for outcome in &self.failed {
            println!(
                "\t\tTest:\t\t\t\t{} - {}",
                outcome.unit,
                outcome.cause.as_deref().unwrap_or("unknown cause")
            );
        }
        println!("-----------------------------------------------------------------");

        if !verbose {
            return;
        }

        let width = self
            .all_outcomes()
            .map(|o| o.unit.len())
            .chain(["Total Run Time".len()])
            .max()
            .unwrap_or(20);

        println!("Timing Results:");
        println!("\t{:<width$}{:>15}", "Test", "Time (sec)");
        println!("\t{}", "-".repeat(width + 15));
        println!("\t{:<width$}{:>15.2}", "setup", self.setup_time.as_secs_f64());

        let mut timed: Vec<&TestOutcome> = self.all_outcomes().collect();
        timed.sort_by(|a, b| a.unit.cmp(&b.unit));
        for outcome in timed {
            println!(
                "\t{:<width$}{:>15.2}",
                outcome.unit,
                outcome.elapsed.as_secs_f64()
            );
        }
        println!(
            "\t{:<width$}{:>15.2}",
            "teardown",
            self.teardown_time.as_secs_f64()
        );

        let total = self.setup_time
            + self.teardown_time
            + self
                .passed
                .iter()
                .chain(&self.failed)
                .map(|o| o.elapsed)
                .sum::<Duration>();
        println!("\t{}", "-".repeat(width + 15));
        println!(
            "\t{:<width$}{:>15.2}",
            "Total Run Time",
            total.as_secs_f64()
        );
    }

    fn all_outcomes(&self) -> impl Iterator<Item = &TestOutcome> {
        self.passed
            .iter()
            .chain(&self.failed)
            .chain(&self.skipped)
    }
}

/// Drives the whole run against one `Config`.
pub struct Orchestrator {
    registry: Registry,
}

impl Orchestrator {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Recursively scan the catalog directory for unit descriptors.
    ///
    /// A file whose first `-` segment does not parse as an integer is not
    /// a test and is skipped with a debug note; a file that has an
    /// ordinal but no suite segment looks like a malformed test and is
    /// skipped with an error note. Traversal order is the directory
    /// order, not numeric order.
    pub fn discover(root: &Path) -> HarnessResult<Vec<TestUnit>> {
        let mut units = Vec::new();
        Self::walk(root, &mut units)?;
        Ok(units)
    }

    fn walk(dir: &Path, units: &mut Vec<TestUnit>) -> HarnessResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                Self::walk(&path, units)?;
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let mut segments = name.splitn(3, '-');

            let Some(num) = segments.next().and_then(|s| s.parse::<u32>().ok()) else {
                debug!("Skipping {}. It doesn't start with an int", name);
                continue;
            };

            let suite = match segments.next() {
                Some(suite) if !suite.is_empty() => suite.to_string(),
                _ => {
                    error!(
                        "Skipping {}. It doesn't conform to the filename format",
                        name
                    );
                    continue;
                }
            };

            units.push(TestUnit {
                num,
                suite,
                name,
                path,
            });
        }
        Ok(())
    }

    /// Run all selected units and return the aggregated summary. The
    /// end-of-run teardown happens even when setup fails part-way.
    pub async fn run(&self, config: &mut Config) -> HarnessResult<RunSummary> {
        let mut summary = RunSummary::default();

        let setup_start = Instant::now();
        let run_result = match self.pre_run_setup(config, true).await {
            Ok(()) => {
                summary.setup_time = setup_start.elapsed();
                self.run_units(config, &mut summary).await
            }
            Err(e) => Err(e),
        };

        let teardown_start = Instant::now();
        self.end_run_teardown(config).await;
        summary.teardown_time = teardown_start.elapsed();

        run_result.map(|()| summary)
    }

    async fn run_units(
        &self,
        config: &mut Config,
        summary: &mut RunSummary,
    ) -> HarnessResult<()> {
        let units = Self::discover(&config.options.ftest_dir)?;

        for unit in &units {
            if !config.selection.selects(unit.num, &unit.suite) {
                continue;
            }

            let Some(case) = self.registry.lookup(&unit.name) else {
                error!(
                    "Skipping {}. No implementation is registered for it",
                    unit.name
                );
                continue;
            };

            let (outcome, recover) = Self::run_unit(case.as_ref(), config, unit).await;
            summary.record(outcome);

            if recover {
                self.recover_environment(config).await?;
            }
        }
        Ok(())
    }

    /// Drive one unit through the lifecycle state machine.
    ///
    /// `teardown` runs whenever `setup` was attempted, including after a
    /// failed setup or test; its own failures are logged and swallowed.
    /// The second return value asks for environment recovery: it is set
    /// when an error or panic escaped the unit, since the ambient cgroup
    /// state may now be inconsistent.
    async fn run_unit(
        case: &dyn TestCase,
        config: &Config,
        unit: &TestUnit,
    ) -> (TestOutcome, bool) {
        debug!("Running test {}", unit.name);
        let start = Instant::now();

        let outcome = |status, cause: Option<String>| TestOutcome {
            unit: unit.name.clone(),
            status,
            cause,
            elapsed: start.elapsed(),
        };

        match guarded(case.prereqs(config)).await {
            Ok(Ok(Verdict::Ready)) => {}
            Ok(Ok(Verdict::Skip(cause))) => {
                return (outcome(TestStatus::Skipped, Some(cause)), false);
            }
            Ok(Err(e)) => return (outcome(TestStatus::Failed, Some(e.to_string())), true),
            Err(panic) => return (outcome(TestStatus::Failed, Some(panic)), true),
        }

        let (status, cause, recover) = match guarded(case.setup(config)).await {
            Ok(Ok(())) => match guarded(case.test(config)).await {
                Ok(Ok(Conclusion::Pass)) => (TestStatus::Passed, None, false),
                Ok(Ok(Conclusion::Fail(cause))) => (TestStatus::Failed, Some(cause), false),
                Ok(Err(e)) => (TestStatus::Failed, Some(e.to_string()), true),
                Err(panic) => (TestStatus::Failed, Some(panic), true),
            },
            Ok(Err(e)) => (
                TestStatus::Failed,
                Some(format!("setup failed: {}", e)),
                true,
            ),
            Err(panic) => (
                TestStatus::Failed,
                Some(format!("setup panicked: {}", panic)),
                true,
            ),
        };

        match guarded(case.teardown(config)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("teardown of {} failed (ignored): {}", unit.name, e),
            Err(panic) => warn!("teardown of {} panicked (ignored): {}", unit.name, panic),
        }

        (outcome(status, cause), recover)
    }

    /// Belt-and-suspenders cleanup, then environment provisioning when a
    /// containerized run was requested.
    async fn pre_run_setup(&self, config: &mut Config, do_teardown: bool) -> HarnessResult<()> {
        if do_teardown {
            // A previous run may not have been cleaned up properly.
            self.end_run_teardown(config).await;
        }

        if config.in_container() {
            self.provision_environment(config).await?;
        }
        Ok(())
    }

    async fn provision_environment(&self, config: &mut Config) -> HarnessResult<()> {
        if let Some(env) = config.environment.as_mut() {
            env.prepare_host().await?;
            env.create().await?;
            env.configure().await?;
            env.start().await?;
        }

        if let Some(env) = config.environment.as_ref() {
            // Some guest releases put sed in a different spot.
            let _ = env
                .exec(&Invocation::argv(["ln", "-s", "/bin/sed", "/usr/bin/sed"]))
                .await;

            // Register the freshly built library with the guest loader.
            let libs = config.options.source_dir.join("src/.libs");
            env.exec(&Invocation::shell(format!(
                "echo {} >> /etc/ld.so.conf.d/libcgroup.conf",
                libs.display()
            )))
            .await?;
            env.exec(&Invocation::argv(["ldconfig"])).await?;
        }
        Ok(())
    }

    async fn end_run_teardown(&self, config: &mut Config) {
        config.tracker.reap(config.environment.as_ref()).await;

        if let Some(env) = config.environment.as_mut() {
            env.teardown().await;
        }
    }

    /// A unit left the run in an unknown state; rebuild the environment
    /// from scratch before the next unit executes.
    async fn recover_environment(&self, config: &mut Config) -> HarnessResult<()> {
        if !config.in_container() {
            return Ok(());
        }

        info!("recreating the container environment after a unit failure");
        self.end_run_teardown(config).await;
        self.pre_run_setup(config, false).await
    }
}

/// Await the unit future, converting an escaped panic into a printable
/// cause. The outer safety net of the lifecycle.
async fn guarded<T, F>(future: F) -> Result<HarnessResult<T>, String>
where
    F: std::future::Future<Output = HarnessResult<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => Ok(result),
        Err(payload) => Err(panic_cause(payload)),
    }
}

fn panic_cause(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unit panicked".to_string()
    }
}
