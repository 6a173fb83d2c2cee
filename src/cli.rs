//! CLI argument definitions for kubeprep.
//!
//! This layer only parses and dispatches; every operation below it takes an
//! already-detected [`SystemInfo`](crate::sysinfo::SystemInfo) and validated
//! parameters.

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "kubeprep")]
#[command(about = "Provision Linux hosts for containerd and kubeadm clusters")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Host facts and base system preparation
    System(SystemArgs),
    /// Container runtime installation
    Container(ContainerArgs),
    /// Kubernetes components and cluster lifecycle
    K8s(K8sArgs),
}

#[derive(Debug, Args)]
pub struct SystemArgs {
    #[command(subcommand)]
    pub action: SystemAction,
}

#[derive(Debug, Subcommand)]
pub enum SystemAction {
    /// Show the detected host facts
    Info,
    /// Install base tooling (wget, curl, vim, net-tools)
    Tool,
    /// Switch package sources and upgrade kernels older than 4.x
    Init {
        /// Use the built-in default mirror for this distro
        #[arg(long)]
        default_source: bool,
        /// URL of a replacement repo definition file
        #[arg(long, value_name = "URL", conflicts_with = "default_source")]
        source: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct ContainerArgs {
    #[command(subcommand)]
    pub action: ContainerAction,
}

#[derive(Debug, Subcommand)]
pub enum ContainerAction {
    /// Install the container runtime (containerd)
    Install {
        /// Install Docker instead of containerd
        #[arg(long)]
        with_docker: bool,
        /// Relocate the runtime's data directory
        #[arg(long, value_name = "PATH")]
        with_data: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct K8sArgs {
    #[command(subcommand)]
    pub action: K8sAction,
}

#[derive(Debug, Subcommand)]
pub enum K8sAction {
    /// Install kubelet, kubeadm, kubectl and CNI at a pinned version
    Install {
        /// Target the Docker runtime instead of containerd
        #[arg(long)]
        with_docker: bool,
        /// Kubernetes version to install
        #[arg(long, value_name = "vX.Y.Z", default_value = "v1.27.6")]
        with_version: String,
    },
    /// Initialize a new cluster on this host
    InitCluster {
        /// Kubernetes version to initialize
        #[arg(long, value_name = "vX.Y.Z", default_value = "v1.27.6")]
        with_version: String,
    },
    /// Print the kubeadm join command for this cluster
    JoinNode {
        /// Join as a control-plane node
        #[arg(long)]
        with_master: bool,
    },
    /// Import local .tar images into the runtime's image store
    LoadImage {
        /// Target the Docker runtime instead of containerd
        #[arg(long)]
        with_docker: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k8s_install_defaults() {
        let cli = Cli::try_parse_from(["kubeprep", "k8s", "install"]).unwrap();
        match cli.command {
            Commands::K8s(args) => match args.action {
                K8sAction::Install {
                    with_docker,
                    with_version,
                } => {
                    assert!(!with_docker);
                    assert_eq!(with_version, "v1.27.6");
                }
                other => panic!("unexpected action: {other:?}"),
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_system_init_sources_conflict() {
        let err = Cli::try_parse_from([
            "kubeprep",
            "system",
            "init",
            "--default-source",
            "--source",
            "https://example.com/repo",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_container_install_data_dir() {
        let cli =
            Cli::try_parse_from(["kubeprep", "container", "install", "--with-data", "/data"])
                .unwrap();
        match cli.command {
            Commands::Container(args) => match args.action {
                ContainerAction::Install { with_data, .. } => {
                    assert_eq!(with_data.as_deref(), Some("/data"));
                }
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_join_node_master_flag() {
        let cli =
            Cli::try_parse_from(["kubeprep", "k8s", "join-node", "--with-master"]).unwrap();
        match cli.command {
            Commands::K8s(args) => {
                assert!(matches!(
                    args.action,
                    K8sAction::JoinNode { with_master: true }
                ));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
