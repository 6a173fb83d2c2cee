//! The concrete configuration artifacts kubeprep generates.
//!
//! Contents here are data, not logic: each constructor returns a fully
//! described [`ConfigArtifact`] for one of the files the runtime or the
//! kubelet reads.

use crate::artifact::{BackupPolicy, ConfigArtifact};
use crate::sysinfo::Arch;

/// Containerd socket, shared by the crictl endpoints and the `ctr` image
/// import invocation. The crictl artifact and the import client must never
/// disagree on this path.
pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";

pub const CONTAINERD_CONFIG_PATH: &str = "/etc/containerd/config.toml";
pub const CRICTL_CONFIG_PATH: &str = "/etc/crictl.yaml";

const DEFAULT_PAUSE_IMAGE: &str = "registry.k8s.io/pause:3.8";
const MIRROR_PAUSE_IMAGE: &str = "registry.aliyuncs.com/google_containers/pause:3.9";
const DEFAULT_DATA_DIR: &str = "/var/lib/containerd";

const KUBE_YUM_MIRROR: &str = "https://mirrors.aliyun.com/kubernetes/yum";
const ELREPO_MIRROR: &str = "https://mirrors.aliyun.com/elrepo/archive/kernel/el7/x86_64";

/// The containerd main config: the runtime's own default dump, with the
/// sandbox image pointed at the mirror, the cgroup driver flipped to
/// systemd, and optionally the data directory relocated.
///
/// Backup is `Required`: silently clobbering a hand-edited containerd
/// config is how nodes end up unexplainable.
pub fn containerd_config(data_dir: Option<&str>) -> ConfigArtifact {
    let mut artifact = ConfigArtifact::from_command(
        "containerd config",
        CONTAINERD_CONFIG_PATH,
        "containerd",
        &["config", "default"],
    )
    .backup(BackupPolicy::Required)
    .substitute(DEFAULT_PAUSE_IMAGE, MIRROR_PAUSE_IMAGE)
    .substitute("SystemdCgroup = false", "SystemdCgroup = true");

    if let Some(dir) = data_dir {
        artifact = artifact.substitute(DEFAULT_DATA_DIR, dir);
    }
    artifact
}

/// `/etc/crictl.yaml`: both endpoints on the containerd socket, 10s timeout.
pub fn crictl_config() -> ConfigArtifact {
    ConfigArtifact::literal(
        "crictl config",
        CRICTL_CONFIG_PATH,
        format!(
            "runtime-endpoint: unix://{sock}\n\
             image-endpoint: unix://{sock}\n\
             timeout: 10\n\
             debug: false",
            sock = CONTAINERD_SOCKET
        ),
    )
}

/// `/etc/sysctl.d/k8s.conf`: bridge traffic through iptables, forwarding
/// on, swapping off.
pub fn sysctl_config() -> ConfigArtifact {
    ConfigArtifact::literal(
        "k8s sysctl config",
        "/etc/sysctl.d/k8s.conf",
        "net.bridge.bridge-nf-call-iptables=1\n\
         net.bridge.bridge-nf-call-ip6tables=1\n\
         net.ipv4.ip_forward=1\n\
         vm.swappiness=0",
    )
}

/// `/etc/modules-load.d/k8s.conf`: the four modules loaded during install,
/// persisted so they come back on boot.
pub fn modules_load_config() -> ConfigArtifact {
    ConfigArtifact::literal(
        "k8s modules-load config",
        "/etc/modules-load.d/k8s.conf",
        "overlay\nbr_netfilter\nip_tables\niptable_filter",
    )
}

/// The kernel modules matching [`modules_load_config`], in load order.
pub const KERNEL_MODULES: [&str; 4] = ["overlay", "br_netfilter", "ip_tables", "iptable_filter"];

/// `/etc/yum.repos.d/kubernetes.repo`: mirror repo for the CentOS branch.
pub fn kubernetes_yum_repo(arch: Arch) -> ConfigArtifact {
    ConfigArtifact::literal(
        "kubernetes yum repo",
        "/etc/yum.repos.d/kubernetes.repo",
        format!(
            "[kubernetes]\n\
             name=Kubernetes\n\
             baseurl={mirror}/repos/kubernetes-el7-{arch}/\n\
             enabled=1\n\
             gpgcheck=0\n\
             repo_gpgcheck=0\n\
             gpgkey={mirror}/doc/yum-key.gpg {mirror}/doc/rpm-package-key.gpg",
            mirror = KUBE_YUM_MIRROR,
            arch = arch.yum_arch(),
        ),
    )
}

/// `/etc/yum.repos.d/elrepo.repo`: long-term kernel repo used by
/// `system init` when the running kernel is too old.
pub fn elrepo_kernel_repo() -> ConfigArtifact {
    ConfigArtifact::literal(
        "elrepo kernel repo",
        "/etc/yum.repos.d/elrepo.repo",
        format!(
            "[elrepo]\n\
             name=elrepo\n\
             baseurl={ELREPO_MIRROR}\n\
             gpgcheck=0\n\
             enabled=1"
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ContentSource;
    use crate::runner::MockRunner;
    use std::fs;
    use tempfile::TempDir;

    /// A plausible slice of `containerd config default` output.
    const CONTAINERD_DUMP: &str = "\
[plugins.\"io.containerd.grpc.v1.cri\"]
  sandbox_image = \"registry.k8s.io/pause:3.8\"
  [plugins.\"io.containerd.grpc.v1.cri\".containerd.runtimes.runc.options]
    SystemdCgroup = false
root = \"/var/lib/containerd\"
";

    fn write_containerd(data_dir: Option<&str>) -> String {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mock = MockRunner::new().with_output("containerd config default", CONTAINERD_DUMP);
        containerd_config(data_dir).at(&path).write(&mock).unwrap();
        fs::read_to_string(&path).unwrap()
    }

    #[test]
    fn test_containerd_config_flips_cgroup_driver() {
        let written = write_containerd(None);
        assert!(written.contains("SystemdCgroup = true"));
        assert!(!written.contains("SystemdCgroup = false"));
    }

    #[test]
    fn test_containerd_config_rewrites_pause_image() {
        let written = write_containerd(None);
        assert!(written.contains("registry.aliyuncs.com/google_containers/pause:3.9"));
        assert!(!written.contains("registry.k8s.io/pause"));
    }

    #[test]
    fn test_containerd_config_relocates_data_dir() {
        let written = write_containerd(Some("/data/containerd"));
        assert!(written.contains("root = \"/data/containerd\""));
        assert!(!written.contains("/var/lib/containerd"));
    }

    #[test]
    fn test_crictl_endpoints_share_the_import_socket() {
        let artifact = crictl_config();
        let content = match &artifact.source {
            ContentSource::Literal(text) => text.clone(),
            _ => panic!("crictl config must be literal"),
        };
        let endpoint = format!("unix://{CONTAINERD_SOCKET}");
        assert_eq!(content.matches(&endpoint).count(), 2);
        assert!(content.contains("timeout: 10"));
    }

    #[test]
    fn test_modules_config_matches_module_list() {
        let artifact = modules_load_config();
        let content = match &artifact.source {
            ContentSource::Literal(text) => text.clone(),
            _ => panic!("modules config must be literal"),
        };
        assert_eq!(content.lines().collect::<Vec<_>>(), KERNEL_MODULES);
    }

    #[test]
    fn test_yum_repo_maps_arch() {
        let artifact = kubernetes_yum_repo(Arch::Arm64);
        let content = match &artifact.source {
            ContentSource::Literal(text) => text.clone(),
            _ => panic!("repo must be literal"),
        };
        assert!(content.contains("kubernetes-el7-aarch64/"));
    }
}
