//! Thin, declarative wrappers around the cgroup command-line tools
//!
//! Each wrapper assembles an argument vector and delegates to the run
//! context (host invoker or container exec). In container mode the tools
//! resolve under the bind-mounted source tree, so the freshly built
//! binaries are the ones under test.

use std::path::PathBuf;

use crate::config::Config;
use crate::error::{HarnessError, HarnessResult};
use crate::services::invoker::Invocation;

/// A setting assignment for cgset: exactly one name=value pair, or a
/// batch applied in order. Exhaustively handled, no runtime shape
/// inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    One { name: String, value: String },
    Many(Vec<(String, String)>),
}

impl Setting {
    pub fn one(name: impl Into<String>, value: impl Into<String>) -> Self {
        Setting::One {
            name: name.into(),
            value: value.into(),
        }
    }

    fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            Setting::One { name, value } => vec![(name.as_str(), value.as_str())],
            Setting::Many(pairs) => pairs
                .iter()
                .map(|(n, v)| (n.as_str(), v.as_str()))
                .collect(),
        }
    }
}

/// Which mount generation exposes a given controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    Unknown,
    V1,
    V2,
}

/// Options for a cgget invocation; the flag grammar itself is the tool's
/// business, this only composes it.
#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    /// `-r` entries.
    pub settings: Vec<String>,
    /// `-g` entries (controller or controller:cgroup).
    pub controllers: Vec<String>,
    /// Trailing cgroup names.
    pub cgroups: Vec<String>,
    /// Omit `-n` (headers are printed by default).
    pub print_headers: bool,
    /// `-v`.
    pub values_only: bool,
    /// `-a`.
    pub all_controllers: bool,
}

pub struct Cgroup;

impl Cgroup {
    /// In container mode the tools come from the bind-mounted build tree;
    /// on the host they resolve through PATH.
    fn tool(config: &Config, name: &str) -> String {
        if config.in_container() {
            config
                .options
                .source_dir
                .join("src/tools")
                .join(name)
                .display()
                .to_string()
        } else {
            name.to_string()
        }
    }

    pub async fn create(
        config: &Config,
        controllers: &[&str],
        cgname: &str,
    ) -> HarnessResult<()> {
        let argv = vec![
            Self::tool(config, "cgcreate"),
            "-g".to_string(),
            format!("{}:{}", controllers.join(","), cgname),
        ];
        config.run(&Invocation::Argv(argv)).await?;
        Ok(())
    }

    pub async fn delete(
        config: &Config,
        controllers: &[&str],
        cgname: &str,
        recursive: bool,
    ) -> HarnessResult<()> {
        let mut argv = vec![Self::tool(config, "cgdelete")];
        if recursive {
            argv.push("-r".to_string());
        }
        argv.push("-g".to_string());
        argv.push(format!("{}:{}", controllers.join(","), cgname));
        config.run(&Invocation::Argv(argv)).await?;
        Ok(())
    }

    pub async fn set(config: &Config, cgname: &str, setting: &Setting) -> HarnessResult<()> {
        let mut argv = vec![Self::tool(config, "cgset")];
        for (name, value) in setting.pairs() {
            argv.push("-r".to_string());
            argv.push(format!("{}={}", name, value));
        }
        argv.push(cgname.to_string());
        config.run(&Invocation::Argv(argv)).await?;
        Ok(())
    }

    /// Set a value and read it straight back; fails unless they match.
    pub async fn set_and_validate(
        config: &Config,
        cgname: &str,
        name: &str,
        value: &str,
    ) -> HarnessResult<()> {
        Self::set(config, cgname, &Setting::one(name, value)).await?;
        let actual = Self::get_value(config, cgname, name).await?;
        if actual != value {
            return Err(HarnessError::UnitFailure {
                cause: format!(
                    "cgset of {}={} read back as {}",
                    name, value, actual
                ),
            });
        }
        Ok(())
    }

    pub async fn get(config: &Config, request: &GetRequest) -> HarnessResult<String> {
        let mut argv = vec![Self::tool(config, "cgget")];

        if !request.print_headers {
            argv.push("-n".to_string());
        }
        if request.values_only {
            argv.push("-v".to_string());
        }
        for setting in &request.settings {
            argv.push("-r".to_string());
            argv.push(setting.clone());
        }
        for controller in &request.controllers {
            argv.push("-g".to_string());
            argv.push(controller.clone());
        }
        if request.all_controllers {
            argv.push("-a".to_string());
        }
        argv.extend(request.cgroups.iter().cloned());

        config.run(&Invocation::Argv(argv)).await
    }

    /// Read a single setting's bare value.
    pub async fn get_value(
        config: &Config,
        cgname: &str,
        setting: &str,
    ) -> HarnessResult<String> {
        Self::get(
            config,
            &GetRequest {
                settings: vec![setting.to_string()],
                cgroups: vec![cgname.to_string()],
                values_only: true,
                ..GetRequest::default()
            },
        )
        .await
    }

    pub async fn classify(
        config: &Config,
        controller: &str,
        cgname: &str,
        pids: &[i32],
    ) -> HarnessResult<()> {
        let mut argv = vec![
            Self::tool(config, "cgclassify"),
            "-g".to_string(),
            format!("{}:{}", controller, cgname),
        ];
        argv.extend(pids.iter().map(|pid| pid.to_string()));
        config.run(&Invocation::Argv(argv)).await?;
        Ok(())
    }

    /// Argument prefix that launches a command already inside the target
    /// cgroup.
    pub fn exec_prefix(config: &Config, controller: &str, cgname: &str) -> Vec<String> {
        vec![
            Self::tool(config, "cgexec"),
            "-g".to_string(),
            format!("{}:{}", controller, cgname),
        ]
    }

    /// Which hierarchy generation the controller is mounted under,
    /// according to the host's mount table.
    pub fn version(controller: &str) -> HarnessResult<CgroupVersion> {
        Ok(Self::scan_mounts(controller)?
            .map(|(version, _)| version)
            .unwrap_or(CgroupVersion::Unknown))
    }

    /// Mount point of the hierarchy the controller lives in.
    pub fn mount_point(controller: &str) -> HarnessResult<Option<PathBuf>> {
        Ok(Self::scan_mounts(controller)?.map(|(_, path)| path))
    }

    fn scan_mounts(controller: &str) -> HarnessResult<Option<(CgroupVersion, PathBuf)>> {
        let mounts = std::fs::read_to_string("/proc/mounts")?;

        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(device), Some(path), Some(_fstype), Some(options)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            if device == "cgroup" {
                if options.split(',').any(|option| option == controller) {
                    return Ok(Some((CgroupVersion::V1, PathBuf::from(path))));
                }
            } else if device == "cgroup2" {
                let listing =
                    std::fs::read_to_string(PathBuf::from(path).join("cgroup.controllers"))?;
                if listing.split_whitespace().any(|c| c == controller) {
                    return Ok(Some((CgroupVersion::V2, PathBuf::from(path))));
                }
            }
        }

        Ok(None)
    }

    /// PIDs currently in the cgroup, via its cgroup.procs pseudo-file.
    pub async fn pids_in_cgroup(
        config: &Config,
        cgname: &str,
        controller: &str,
    ) -> HarnessResult<Vec<i32>> {
        Self::read_membership(config, cgname, controller, "cgroup.procs").await
    }

    /// Thread IDs currently in the cgroup, via cgroup.threads (v2 only).
    pub async fn threads_in_cgroup(
        config: &Config,
        cgname: &str,
        controller: &str,
    ) -> HarnessResult<Vec<i32>> {
        Self::read_membership(config, cgname, controller, "cgroup.threads").await
    }

    async fn read_membership(
        config: &Config,
        cgname: &str,
        controller: &str,
        file: &str,
    ) -> HarnessResult<Vec<i32>> {
        let mount = Self::mount_point(controller)?.ok_or_else(|| {
            HarnessError::config(format!("controller '{}' is not mounted", controller))
        })?;
        let path = mount.join(cgname).join(file);

        let contents = config
            .run(&Invocation::argv(["cat", &path.display().to_string()]))
            .await?;

        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .collect())
    }

    /// Hierarchy membership lines of one process, from its per-process
    /// pseudo-file.
    pub fn proc_cgroups(pid: i32) -> HarnessResult<Vec<String>> {
        let contents = std::fs::read_to_string(format!("/proc/{}/cgroup", pid))?;
        Ok(contents.lines().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;

    fn host_config() -> Config {
        Config::new(RunOptions {
            container: false,
            ..RunOptions::default()
        })
    }

    #[test]
    fn setting_one_renders_a_single_pair() {
        let setting = Setting::one("cpu.shares", "512");
        assert_eq!(setting.pairs(), vec![("cpu.shares", "512")]);
    }

    #[test]
    fn setting_many_preserves_order() {
        let setting = Setting::Many(vec![
            ("cpuset.cpus".to_string(), "0".to_string()),
            ("cpuset.mems".to_string(), "0".to_string()),
        ]);
        assert_eq!(
            setting.pairs(),
            vec![("cpuset.cpus", "0"), ("cpuset.mems", "0")]
        );
    }

    #[test]
    fn host_mode_tools_resolve_through_path() {
        let config = host_config();
        assert_eq!(Cgroup::tool(&config, "cgget"), "cgget");
    }

    #[test]
    fn container_mode_tools_resolve_under_source_tree() {
        let config = Config::new(RunOptions::default());
        let tool = Cgroup::tool(&config, "cgget");
        assert!(tool.ends_with("src/tools/cgget"), "got {}", tool);
    }

    #[test]
    fn exec_prefix_targets_the_cgroup() {
        let config = host_config();
        let prefix = Cgroup::exec_prefix(&config, "cpu", "workers");
        assert_eq!(prefix, vec!["cgexec", "-g", "cpu:workers"]);
    }
}
