//! `kubeprep k8s` — Kubernetes components and cluster lifecycle.
//!
//! Four operations: install the kubelet/kubeadm/kubectl stack at a pinned
//! version, initialize a fresh cluster, print the join command for a new
//! node, and import locally staged images into containerd.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::artifacts::{self, CONTAINERD_SOCKET};
use crate::cli::{K8sAction, K8sArgs};
use crate::net;
use crate::output::Output;
use crate::pipeline::{Pipeline, Step};
use crate::runner::CommandRunner;
use crate::sysinfo::{Distro, SystemInfo};

const KUBE_APT_MIRROR: &str = "https://mirrors.aliyun.com/kubernetes/apt";
const IMAGE_REPOSITORY: &str = "registry.aliyuncs.com/google_containers";
const SERVICE_CIDR: &str = "10.96.0.0/16";
const POD_CIDR: &str = "10.244.0.0/16";
const API_SERVER_PORT: u16 = 6443;

/// Codename used when the mirror has no repository for the host's release.
const LEGACY_APT_CODENAME: &str = "xenial";

/// Directory scanned by `load-image` for staged image tarballs.
const IMAGE_DIR: &str = "./image";
/// Containerd namespace the kubelet pulls images from.
const IMAGE_NAMESPACE: &str = "k8s.io";

const NETWORK_MANIFEST: &str = "./config/calico.yaml";
const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// Shell pipe deriving the CA public-key digest kubeadm expects in
/// `--discovery-token-ca-cert-hash`.
const CA_CERT_HASH_PIPE: &str = "openssl x509 -pubkey -in /etc/kubernetes/pki/ca.crt \
     | openssl rsa -pubin -outform der 2>/dev/null \
     | openssl dgst -sha256 -hex | sed 's/^.* //'";

/// Shell pipe resolving the primary interface's IPv4 address.
const ADVERTISE_ADDR_PIPE: &str =
    r#"ifconfig eth0 | grep "inet" | cut -d ':' -f 2 | cut -d ' ' -f 1 | awk '{print $2}'"#;

pub fn run(args: K8sArgs, info: &SystemInfo, runner: &dyn CommandRunner) -> Result<()> {
    match args.action {
        K8sAction::Install {
            with_docker,
            with_version,
        } => install(info, runner, &with_version, with_docker),
        K8sAction::InitCluster { with_version } => init_cluster(runner, &with_version),
        K8sAction::JoinNode { with_master } => join_node(runner, with_master),
        K8sAction::LoadImage { with_docker } => load_images(runner, with_docker),
    }
}

// ============================================================================
// Install
// ============================================================================

pub fn install(
    info: &SystemInfo,
    runner: &dyn CommandRunner,
    version: &str,
    with_docker: bool,
) -> Result<()> {
    let apt_codename = match info.distro {
        Distro::Ubuntu | Distro::Debian => {
            resolve_apt_codename(&info.code_name, net::remote_file_exists)
        }
        _ => String::new(),
    };

    let steps = install_steps(info, version, &apt_codename)?;
    Pipeline::new(format!("install kubernetes ({})", info.distro), steps).run(runner)?;

    // Freshly installed kubelets need the staged images before the first
    // static pods can start.
    load_images(runner, with_docker)
}

/// The mirror hosts per-codename apt repositories only for some releases;
/// probe for the host's own, fall back to the legacy path.
fn resolve_apt_codename(code_name: &str, probe: impl Fn(&str) -> bool) -> String {
    if !code_name.is_empty() {
        let url = format!("{KUBE_APT_MIRROR}/kubernetes-{code_name}/Release");
        if probe(&url) {
            return code_name.to_string();
        }
    }
    LEGACY_APT_CODENAME.to_string()
}

/// Ordered step list for the install operation, keyed off the distro.
fn install_steps(info: &SystemInfo, version: &str, apt_codename: &str) -> Result<Vec<Step>> {
    let version = version.trim_start_matches('v');

    let mut steps = vec![
        Step::cmd("disable swap", "swapoff", &["-a"]).best_effort(),
        Step::cmd(
            "comment swap in fstab",
            "sed",
            &["-i", "s/.*swap.*/#&/", "/etc/fstab"],
        )
        .best_effort(),
    ];

    // Debian-family repo tooling has to be present before the sysctl and
    // module steps so the later apt operations do not interleave installs.
    match info.distro {
        Distro::Ubuntu => {
            steps.push(Step::cmd("refresh package index", "apt", &["update"]));
            steps.push(Step::cmd(
                "install https transport",
                "apt",
                &["install", "-y", "apt-transport-https"],
            ));
        }
        Distro::Debian => {
            steps.push(Step::cmd("refresh package index", "apt", &["update"]));
            steps.push(Step::cmd(
                "install https transport and gnupg",
                "apt",
                &["install", "-y", "apt-transport-https", "gnupg2", "gnupg1", "gnupg"],
            ));
            steps.push(Step::cmd(
                "install repo management tools",
                "apt",
                &["install", "-y", "software-properties-common", "dirmngr", "ca-certificates"],
            ));
        }
        Distro::CentOS => {}
        Distro::Unknown => {
            bail!("unsupported Linux distribution: {}", info.distro_version)
        }
    }

    steps.push(Step::artifact(artifacts::sysctl_config()));
    steps.push(Step::cmd("apply sysctl settings", "sysctl", &["--system"]));

    let pkg_mgr = match info.distro {
        Distro::CentOS => "yum",
        _ => "apt",
    };
    steps.push(Step::cmd(
        "install ipset and ipvsadm",
        pkg_mgr,
        &["install", "-y", "ipset", "ipvsadm"],
    ));

    for module in artifacts::KERNEL_MODULES {
        steps.push(Step::cmd(
            format!("load kernel module {module}"),
            "modprobe",
            &[module],
        ));
    }
    steps.push(Step::artifact(artifacts::modules_load_config()));

    match info.distro {
        Distro::CentOS => {
            steps.push(Step::artifact(artifacts::kubernetes_yum_repo(info.arch)));
            let kubelet = format!("kubelet-{version}-0");
            let kubeadm = format!("kubeadm-{version}-0");
            let kubectl = format!("kubectl-{version}-0");
            steps.push(Step::cmd(
                "install kubernetes components",
                "yum",
                &[
                    "install",
                    "-y",
                    &kubelet,
                    &kubeadm,
                    &kubectl,
                    "kubernetes-cni",
                    "--disableexcludes=kubernetes",
                    "--nogpgcheck",
                ],
            ));
        }
        Distro::Ubuntu | Distro::Debian => {
            steps.push(Step::shell(
                "import kubernetes apt key",
                format!("curl -fsSL {KUBE_APT_MIRROR}/doc/apt-key.gpg | apt-key add -"),
            ));
            steps.push(Step::shell(
                "add kubernetes apt repo",
                format!(
                    "add-apt-repository \"deb [arch={arch}] {KUBE_APT_MIRROR}/ kubernetes-{apt_codename} main\"",
                    arch = info.arch.as_str(),
                ),
            ));
            steps.push(Step::cmd("refresh package index", "apt", &["update"]));
            let kubelet = format!("kubelet={version}-00");
            let kubeadm = format!("kubeadm={version}-00");
            let kubectl = format!("kubectl={version}-00");
            steps.push(Step::cmd(
                "install kubernetes components",
                "apt",
                &["install", "-y", &kubelet, &kubeadm, &kubectl, "kubernetes-cni"],
            ));
        }
        Distro::Unknown => unreachable!("rejected above"),
    }

    steps.push(Step::cmd("reload systemd units", "systemctl", &["daemon-reload"]));
    steps.push(Step::cmd(
        "enable and start kubelet",
        "systemctl",
        &["enable", "kubelet", "--now"],
    ));
    steps.push(Step::cmd("show kubelet status", "systemctl", &["status", "kubelet"]).best_effort());

    Ok(steps)
}

// ============================================================================
// Init cluster
// ============================================================================

pub fn init_cluster(runner: &dyn CommandRunner, version: &str) -> Result<()> {
    let addr = advertise_address(runner)?;
    let home = std::env::var("HOME").context("HOME is not set")?;
    let kube_dir = format!("{home}/.kube");
    let kube_config = format!("{kube_dir}/config");
    let owner = format!(
        "{}:{}",
        nix::unistd::Uid::effective(),
        nix::unistd::Gid::effective()
    );

    Output::info("Initializing Kubernetes cluster...");
    let steps = vec![
        Step::shell(
            "kubeadm init",
            format!(
                "kubeadm init \
                 --image-repository={IMAGE_REPOSITORY} \
                 --apiserver-advertise-address={addr} \
                 --kubernetes-version={version} \
                 --service-cidr={SERVICE_CIDR} \
                 --pod-network-cidr={POD_CIDR}"
            ),
        ),
        Step::cmd("create kubeconfig directory", "mkdir", &["-p", &kube_dir]),
        Step::cmd(
            "install admin kubeconfig",
            "cp",
            &["-i", ADMIN_KUBECONFIG, &kube_config],
        ),
        Step::cmd("own kubeconfig", "chown", &[&owner, &kube_config]),
        Step::cmd(
            "apply network plugin",
            "kubectl",
            &["apply", "-f", NETWORK_MANIFEST],
        ),
        Step::cmd("show node status", "kubectl", &["get", "nodes"]),
    ];
    Pipeline::new("init cluster", steps).run(runner)
}

fn advertise_address(runner: &dyn CommandRunner) -> Result<String> {
    let addr = runner
        .shell_output(ADVERTISE_ADDR_PIPE)
        .context("failed to probe the primary network interface")?;
    if addr.is_empty() {
        bail!("could not resolve an advertise address from eth0");
    }
    Ok(addr)
}

// ============================================================================
// Join node
// ============================================================================

pub fn join_node(runner: &dyn CommandRunner, with_master: bool) -> Result<()> {
    let cert_key = if with_master {
        Some(upload_certificate_key(runner)?)
    } else {
        None
    };

    let token = runner
        .output("kubeadm", &["token", "create"])
        .context("failed to create a bootstrap token")?;
    let ca_hash = runner
        .shell_output(CA_CERT_HASH_PIPE)
        .context("failed to derive the CA certificate hash")?;
    let addr = advertise_address(runner)?;

    let command = join_command(&addr, &token, &ca_hash, cert_key.as_deref());

    // Printed for the operator to run on the joining node, never executed
    // here: this process runs on the control plane.
    println!("{command}");
    Ok(())
}

/// Assemble the join command line. Pure so the exact wording is testable.
fn join_command(addr: &str, token: &str, ca_hash: &str, cert_key: Option<&str>) -> String {
    let mut command = format!(
        "kubeadm join {addr}:{API_SERVER_PORT} --token {token} \
         --discovery-token-ca-cert-hash sha256:{ca_hash}"
    );
    if let Some(key) = cert_key {
        command.push_str(&format!(" --control-plane --certificate-key {key}"));
    }
    command
}

/// Upload fresh control-plane certificates and pull the key out of the
/// command's output: the key is the first line that is purely alphanumeric
/// (everything else kubeadm prints carries punctuation).
fn upload_certificate_key(runner: &dyn CommandRunner) -> Result<String> {
    let out = runner
        .output("kubeadm", &["init", "phase", "upload-certs", "--upload-certs"])
        .context("failed to upload control-plane certificates")?;
    parse_certificate_key(&out).context("certificate key not found in upload-certs output")
}

fn parse_certificate_key(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_string)
}

// ============================================================================
// Load images
// ============================================================================

pub fn load_images(runner: &dyn CommandRunner, with_docker: bool) -> Result<()> {
    if with_docker {
        bail!("docker image loading is not supported; images are imported into containerd");
    }
    Output::info(format!("Loading container images from {IMAGE_DIR}..."));
    import_tar_images(Path::new(IMAGE_DIR), runner)
}

/// Import every `.tar` under `dir` (recursively) into the kubelet's
/// containerd namespace. Non-tar files are skipped; the first read or
/// import error aborts the walk.
fn import_tar_images(dir: &Path, runner: &dyn CommandRunner) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();

        if path.is_dir() {
            import_tar_images(&path, runner)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("tar") {
            continue;
        }

        tracing::info!(image = %path.display(), "importing image archive");
        Output::step(format!("importing {}", path.display()));
        let path_str = path.to_string_lossy();
        runner
            .run(
                "ctr",
                &[
                    "-a",
                    CONTAINERD_SOCKET,
                    "-n",
                    IMAGE_NAMESPACE,
                    "images",
                    "import",
                    path_str.as_ref(),
                ],
            )
            .with_context(|| format!("failed to import {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use crate::sysinfo::{Arch, OsKind};
    use std::fs;
    use tempfile::TempDir;

    fn host(distro: Distro, code_name: &str) -> SystemInfo {
        SystemInfo {
            os: OsKind::Linux,
            arch: Arch::Amd64,
            distro,
            distro_version: format!("{distro} test host"),
            code_name: code_name.into(),
            kernel: "5.15.0".into(),
            kernel_major: 5,
            cpu_cores: 2,
        }
    }

    #[test]
    fn test_worker_join_command_wording() {
        assert_eq!(
            join_command("10.0.0.5", "abc.def", "deadbeef", None),
            "kubeadm join 10.0.0.5:6443 --token abc.def \
             --discovery-token-ca-cert-hash sha256:deadbeef"
        );
    }

    #[test]
    fn test_control_plane_join_command_wording() {
        assert_eq!(
            join_command("10.0.0.5", "abc.def", "deadbeef", Some("cafe01")),
            "kubeadm join 10.0.0.5:6443 --token abc.def \
             --discovery-token-ca-cert-hash sha256:deadbeef \
             --control-plane --certificate-key cafe01"
        );
    }

    #[test]
    fn test_parse_certificate_key_skips_prose() {
        let out = "[upload-certs] Storing the certificates in Secret \"kubeadm-certs\"\n\
                   [upload-certs] Using certificate key:\n\
                   5a3c1ffb8d6e02f94cc2b01a33e8f7d4\n";
        assert_eq!(
            parse_certificate_key(out).as_deref(),
            Some("5a3c1ffb8d6e02f94cc2b01a33e8f7d4")
        );
    }

    #[test]
    fn test_parse_certificate_key_missing() {
        assert_eq!(parse_certificate_key("no key in here!"), None);
    }

    #[test]
    fn test_resolve_apt_codename_prefers_probed_release() {
        let resolved = resolve_apt_codename("jammy", |url| {
            assert!(url.ends_with("/kubernetes-jammy/Release"));
            true
        });
        assert_eq!(resolved, "jammy");
    }

    #[test]
    fn test_resolve_apt_codename_falls_back_to_legacy() {
        assert_eq!(resolve_apt_codename("jammy", |_| false), "xenial");
        // No codename at all never probes.
        assert_eq!(resolve_apt_codename("", |_| panic!("no probe")), "xenial");
    }

    #[test]
    fn test_centos_install_steps_pin_version_and_order() {
        let steps = install_steps(&host(Distro::CentOS, ""), "v1.27.6", "").unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();

        // Swap handling first, service start last.
        assert_eq!(names[0], "disable swap");
        assert_eq!(names[names.len() - 2], "enable and start kubelet");

        let rendered = format!("{steps:?}");
        assert!(rendered.contains("kubelet-1.27.6-0"));
        assert!(rendered.contains("--disableexcludes=kubernetes"));
        // The version pin must not keep the leading "v".
        assert!(!rendered.contains("v1.27.6"));
    }

    #[test]
    fn test_debian_install_steps_use_resolved_codename() {
        let steps = install_steps(&host(Distro::Debian, "bookworm"), "v1.27.6", "bookworm").unwrap();
        let rendered = format!("{steps:?}");
        assert!(rendered.contains("kubernetes-bookworm main"));
        assert!(rendered.contains("kubelet=1.27.6-00"));
        assert!(rendered.contains("[arch=amd64]"));
    }

    #[test]
    fn test_unknown_distro_is_rejected() {
        assert!(install_steps(&host(Distro::Unknown, ""), "v1.27.6", "").is_err());
    }

    #[test]
    fn test_join_node_control_plane_prints_assembled_command() {
        let mock = MockRunner::new()
            .with_output(
                "kubeadm init phase upload-certs --upload-certs",
                "[upload-certs] Using certificate key:\ncafe01\n",
            )
            .with_output("kubeadm token create", "abc.def\n")
            .with_output(format!("/bin/bash -c {CA_CERT_HASH_PIPE}"), "deadbeef\n")
            .with_output(format!("/bin/bash -c {ADVERTISE_ADDR_PIPE}"), "10.0.0.5\n");

        join_node(&mock, true).unwrap();
        // All four probes ran, in order: cert key, token, hash, address.
        assert_eq!(mock.call_count(), 4);
    }

    #[test]
    fn test_import_walks_only_tar_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("pause.tar"), b"x").unwrap();
        fs::write(dir.path().join("README.md"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/etcd.tar"), b"x").unwrap();

        let mock = MockRunner::new();
        import_tar_images(dir.path(), &mock).unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        for call in &calls {
            assert!(call.starts_with(&format!("ctr -a {CONTAINERD_SOCKET} -n k8s.io images import")));
            assert!(call.ends_with(".tar"));
        }
    }

    #[test]
    fn test_import_missing_directory_errors() {
        let mock = MockRunner::new();
        let err = import_tar_images(Path::new("/no/such/dir"), &mock).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
