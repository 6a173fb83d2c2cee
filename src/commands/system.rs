//! `kubeprep system` — host facts and base system preparation.
//!
//! `info` prints the detected fact-base, `tool` installs the small set of
//! utilities later steps assume, and `init` switches the package source to
//! a mirror and upgrades pre-4.x kernels on CentOS.

use anyhow::{bail, Result};

use crate::artifacts;
use crate::cli::{SystemAction, SystemArgs};
use crate::output::Output;
use crate::pipeline::{Pipeline, Step};
use crate::runner::CommandRunner;
use crate::sysinfo::{Distro, OsKind, SystemInfo};

const CENTOS_BASE_REPO: &str = "/etc/yum.repos.d/CentOS-Base.repo";
const CENTOS_DEFAULT_SOURCE: &str = "https://mirrors.aliyun.com/repo/Centos-7.repo";

/// Kernels older than this major get upgraded by `system init`.
const MIN_KERNEL_MAJOR: u32 = 4;
const UPGRADE_KERNEL_PACKAGE: &str = "kernel-lt-5.4.262";
const UPGRADE_KERNEL_DEVEL_PACKAGE: &str = "kernel-lt-devel-5.4.262";

pub fn run(args: SystemArgs, info: &SystemInfo, runner: &dyn CommandRunner) -> Result<()> {
    match args.action {
        SystemAction::Info => {
            print_info(info);
            Ok(())
        }
        SystemAction::Tool => install_tools(info, runner),
        SystemAction::Init {
            default_source,
            source,
        } => init(info, runner, default_source, source.as_deref()),
    }
}

fn print_info(info: &SystemInfo) {
    Output::header("System");
    Output::kv("OS", if info.os == OsKind::Linux { "linux" } else { "other" });
    Output::kv("Arch", info.arch.as_str());
    Output::kv("Distro", &info.distro_version);
    if !info.code_name.is_empty() {
        Output::kv("Codename", &info.code_name);
    }
    Output::kv("Kernel", &info.kernel);
    Output::kv("CPUs", info.cpu_cores.to_string());
}

fn install_tools(info: &SystemInfo, runner: &dyn CommandRunner) -> Result<()> {
    let step = match info.distro {
        Distro::CentOS => Step::cmd(
            "install base tools",
            "yum",
            &["install", "-y", "wget", "curl", "vim", "net-tools"],
        ),
        Distro::Ubuntu | Distro::Debian => Step::cmd(
            "install base tools",
            "apt",
            &["install", "-y", "wget", "curl", "vim", "net-tools"],
        ),
        Distro::Unknown => bail!("unsupported Linux distribution: {}", info.distro_version),
    };
    Pipeline::new("system tool", vec![step]).run(runner)
}

fn init(
    info: &SystemInfo,
    runner: &dyn CommandRunner,
    default_source: bool,
    source: Option<&str>,
) -> Result<()> {
    let source_url = if default_source {
        default_source_for(info.distro)
    } else {
        source
    };

    if let Some(url) = source_url {
        change_source(info, runner, url)?;
    }

    if info.kernel_major < MIN_KERNEL_MAJOR {
        Output::info(format!(
            "kernel {} is older than {}.x, upgrading",
            info.kernel, MIN_KERNEL_MAJOR
        ));
        upgrade_kernel(info, runner)?;
    }

    Ok(())
}

fn default_source_for(distro: Distro) -> Option<&'static str> {
    // Only the CentOS mirror ships a drop-in repo file; the apt distros
    // keep their stock sources.
    match distro {
        Distro::CentOS => Some(CENTOS_DEFAULT_SOURCE),
        _ => None,
    }
}

fn change_source(info: &SystemInfo, runner: &dyn CommandRunner, url: &str) -> Result<()> {
    match info.distro {
        Distro::CentOS => {
            let backup = format!("{CENTOS_BASE_REPO}.bak");
            let steps = vec![
                Step::cmd("back up base repo", "mv", &[CENTOS_BASE_REPO, &backup]),
                Step::cmd("fetch replacement repo", "wget", &["-O", CENTOS_BASE_REPO, url]),
                Step::cmd("clean yum cache", "yum", &["clean", "all"]),
                Step::cmd("rebuild yum cache", "yum", &["makecache"]),
                Step::cmd("update packages", "yum", &["update", "-y"]),
            ];
            Pipeline::new("system init: change source", steps).run(runner)
        }
        Distro::Ubuntu | Distro::Debian => Ok(()),
        Distro::Unknown => bail!("unsupported Linux distribution: {}", info.distro_version),
    }
}

fn upgrade_kernel(info: &SystemInfo, runner: &dyn CommandRunner) -> Result<()> {
    match info.distro {
        Distro::CentOS => {
            Pipeline::new("system init: kernel upgrade", kernel_upgrade_steps()).run(runner)?;
            Output::success("kernel upgraded; takes effect after reboot");
            Ok(())
        }
        // No kernel upgrade path for the apt distros.
        _ => Ok(()),
    }
}

fn kernel_upgrade_steps() -> Vec<Step> {
    vec![
        Step::artifact(artifacts::elrepo_kernel_repo()),
        Step::cmd("clean yum cache", "yum", &["clean", "all"]),
        Step::cmd("rebuild yum cache", "yum", &["makecache"]),
        Step::cmd("install lt kernel", "yum", &["install", "-y", UPGRADE_KERNEL_PACKAGE]),
        Step::cmd(
            "install lt kernel headers",
            "yum",
            &["install", "-y", UPGRADE_KERNEL_DEVEL_PACKAGE],
        ),
        Step::cmd("select new default kernel", "grub2-set-default", &["0"]).best_effort(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use crate::sysinfo::{Arch, OsKind};

    fn centos(kernel_major: u32) -> SystemInfo {
        SystemInfo {
            os: OsKind::Linux,
            arch: Arch::Amd64,
            distro: Distro::CentOS,
            distro_version: "CentOS Linux release 7.9.2009 (Core)".into(),
            code_name: String::new(),
            kernel: format!("{kernel_major}.10.0-1160.el7.x86_64"),
            kernel_major,
            cpu_cores: 4,
        }
    }

    #[test]
    fn test_init_with_default_source_runs_source_switch() {
        let mock = MockRunner::new();
        init(&centos(5), &mock, true, None).unwrap();
        let calls = mock.calls();
        assert!(calls[0].starts_with("mv /etc/yum.repos.d/CentOS-Base.repo"));
        assert!(calls[1].contains(CENTOS_DEFAULT_SOURCE));
        assert_eq!(calls.last().unwrap(), "yum update -y");
    }

    #[test]
    fn test_init_skips_source_switch_without_url() {
        let mock = MockRunner::new();
        init(&centos(5), &mock, false, None).unwrap();
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_kernel_upgrade_steps_install_lt_kernel() {
        let steps = kernel_upgrade_steps();
        assert_eq!(steps[0].name, "write elrepo kernel repo");

        let rendered = format!("{steps:?}");
        assert!(rendered.contains(UPGRADE_KERNEL_PACKAGE));
        assert!(rendered.contains(UPGRADE_KERNEL_DEVEL_PACKAGE));
        assert!(rendered.contains("grub2-set-default"));
    }

    #[test]
    fn test_tools_unsupported_distro_errors() {
        let mut info = centos(5);
        info.distro = Distro::Unknown;
        assert!(install_tools(&info, &MockRunner::new()).is_err());
    }
}
