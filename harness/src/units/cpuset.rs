//! Units exercising the cpuset controller.

use async_trait::async_trait;

use crate::cgroup::{Cgroup, CgroupVersion};
use crate::config::Config;
use crate::error::HarnessResult;
use crate::traits::{Conclusion, TestCase, Verdict};

const CONTROLLER: &str = "cpuset";

/// A fresh cpuset group starts out non-exclusive.
pub struct ExclusiveRead;

#[async_trait]
impl TestCase for ExclusiveRead {
    fn file(&self) -> &'static str {
        "005-cpuset-exclusive_read"
    }

    async fn prereqs(&self, _config: &Config) -> HarnessResult<Verdict> {
        match Cgroup::version(CONTROLLER)? {
            CgroupVersion::V1 => Ok(Verdict::Ready),
            _ => Ok(Verdict::Skip(
                "cpu_exclusive requires the legacy cpuset hierarchy".to_string(),
            )),
        }
    }

    async fn setup(&self, config: &Config) -> HarnessResult<()> {
        Cgroup::create(config, &[CONTROLLER], "005exclusive").await
    }

    async fn test(&self, config: &Config) -> HarnessResult<Conclusion> {
        let value = Cgroup::get_value(config, "005exclusive", "cpuset.cpu_exclusive").await?;

        if value == "0" {
            Ok(Conclusion::Pass)
        } else {
            Ok(Conclusion::Fail(format!(
                "cpuset.cpu_exclusive defaulted to {} instead of 0",
                value
            )))
        }
    }

    async fn teardown(&self, config: &Config) -> HarnessResult<()> {
        Cgroup::delete(config, &[CONTROLLER], "005exclusive", false).await
    }
}
