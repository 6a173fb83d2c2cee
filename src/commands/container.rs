//! `kubeprep container install` — containerd runtime installation.
//!
//! CentOS installs from the docker-ce yum repo; the apt distros pin
//! whatever version `apt-cache madison` reports as newest. Both branches
//! converge on the same config artifacts and service start.

use anyhow::{bail, Context, Result};

use crate::artifacts;
use crate::cli::{ContainerAction, ContainerArgs};
use crate::pipeline::{Pipeline, Step};
use crate::runner::CommandRunner;
use crate::sysinfo::{Distro, SystemInfo};

const DOCKER_CE_REPO: &str = "https://mirrors.aliyun.com/docker-ce/linux/centos/docker-ce.repo";

pub fn run(args: ContainerArgs, info: &SystemInfo, runner: &dyn CommandRunner) -> Result<()> {
    match args.action {
        ContainerAction::Install {
            with_docker,
            with_data,
        } => install(info, runner, with_docker, with_data.as_deref()),
    }
}

pub fn install(
    info: &SystemInfo,
    runner: &dyn CommandRunner,
    with_docker: bool,
    data_dir: Option<&str>,
) -> Result<()> {
    if with_docker {
        bail!("docker runtime installation is not supported; install containerd instead");
    }
    match info.distro {
        Distro::CentOS => install_centos(runner, data_dir),
        Distro::Ubuntu | Distro::Debian => install_debian_family(runner, data_dir),
        Distro::Unknown => bail!("unsupported Linux distribution: {}", info.distro_version),
    }
}

/// The steps shared by every distro branch: write the runtime config and
/// the crictl endpoints, then bring the service up.
fn configure_and_start_steps(data_dir: Option<&str>, service: &str) -> Vec<Step> {
    vec![
        Step::artifact(artifacts::containerd_config(data_dir)),
        Step::artifact(artifacts::crictl_config()),
        Step::cmd(
            "enable and start containerd",
            "systemctl",
            &["enable", "--now", service],
        ),
    ]
}

fn install_centos(runner: &dyn CommandRunner, data_dir: Option<&str>) -> Result<()> {
    let mut steps = vec![
        Step::cmd("stop firewalld", "systemctl", &["stop", "firewalld.service"]).best_effort(),
        Step::cmd(
            "disable firewalld",
            "systemctl",
            &["disable", "firewalld.service"],
        )
        .best_effort(),
        Step::cmd("set selinux permissive", "setenforce", &["0"]).best_effort(),
        Step::cmd(
            "persist selinux mode",
            "sed",
            &[
                "-i",
                "s/^SELINUX=enforcing$/SELINUX=permissive/",
                "/etc/selinux/config",
            ],
        )
        .best_effort(),
        Step::cmd(
            "install repo prerequisites",
            "yum",
            &["install", "-y", "yum-utils", "device-mapper-persistent-data", "lvm2"],
        ),
        Step::cmd(
            "add docker-ce repo",
            "yum-config-manager",
            &["--add-repo", DOCKER_CE_REPO],
        ),
        Step::cmd(
            "install containerd and runc",
            "yum",
            &["install", "-y", "containerd.io", "runc"],
        ),
        Step::cmd(
            "stop containerd before reconfiguring",
            "systemctl",
            &["stop", "containerd.service"],
        ),
    ];
    steps.extend(configure_and_start_steps(data_dir, "containerd.service"));

    Pipeline::new("install containerd (CentOS)", steps).run(runner)
}

fn install_debian_family(runner: &dyn CommandRunner, data_dir: Option<&str>) -> Result<()> {
    let mut prepare = Pipeline::new(
        "install containerd: prepare",
        vec![
            Step::cmd("disable ufw", "systemctl", &["disable", "ufw", "--now"]).best_effort(),
            Step::cmd("refresh package index", "apt-get", &["update"]),
        ],
    );
    prepare.run(runner)?;

    // Pin the newest version apt knows about so a later `apt upgrade`
    // cannot move the runtime under a running cluster.
    let madison = runner
        .output("apt-cache", &["madison", "containerd"])
        .context("failed to query available containerd versions")?;
    let version = parse_madison_version(&madison)
        .context("could not resolve a containerd version from apt-cache madison")?;
    let pinned = format!("containerd={version}");

    let mut steps = vec![Step::cmd(
        "install pinned containerd",
        "apt",
        &["install", "-y", &pinned],
    )];
    steps.extend(configure_and_start_steps(data_dir, "containerd"));

    Pipeline::new("install containerd (apt)", steps).run(runner)
}

/// First version column of the first `apt-cache madison` line.
///
/// Lines look like `containerd | 1.7.2-0ubuntu1 | http://... jammy/main`.
fn parse_madison_version(madison: &str) -> Option<String> {
    let first = madison.lines().next()?;
    let mut fields = first.split('|');
    let _name = fields.next()?;
    let version = fields.next()?.trim();
    // A malformed line without a source column is not a version listing.
    fields.next()?;
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}
