//! Host capability detection.
//!
//! [`SystemInfo`] is the immutable fact-base every pipeline reads. It is
//! detected exactly once, by `main`, and passed by reference into every
//! operation; nothing mutates it afterward. Detection requires a Linux host
//! and root privilege — anything else is fatal before a single step runs.

use std::fmt;
use std::thread;

use crate::error::DetectError;
use crate::runner::CommandRunner;

/// How many times to attempt the release-info query, installing the
/// missing tool between attempts, before giving up.
const BOOTSTRAP_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    Linux,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    Other,
}

impl Arch {
    /// The architecture name apt uses in `deb [arch=...]` stanzas.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Other => "unknown",
        }
    }

    /// The architecture name yum repos encode in their baseurl.
    pub fn yum_arch(&self) -> &'static str {
        match self {
            Arch::Amd64 => "x86_64",
            Arch::Arm64 => "aarch64",
            Arch::Other => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    CentOS,
    Ubuntu,
    Debian,
    Unknown,
}

impl Distro {
    /// Match the distribution from a free-form description string.
    ///
    /// Substring match in fixed priority order; the first hit wins.
    pub fn from_description(description: &str) -> Distro {
        if description.contains("CentOS") {
            Distro::CentOS
        } else if description.contains("Ubuntu") {
            Distro::Ubuntu
        } else if description.contains("Debian") {
            Distro::Debian
        } else {
            Distro::Unknown
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Distro::CentOS => "CentOS",
            Distro::Ubuntu => "Ubuntu",
            Distro::Debian => "Debian",
            Distro::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// The once-detected, read-only fact-base describing the host.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub os: OsKind,
    pub arch: Arch,
    pub distro: Distro,
    /// Full distribution description, e.g. `Ubuntu 22.04.3 LTS`.
    pub distro_version: String,
    /// Release codename, e.g. `jammy`. May be empty.
    pub code_name: String,
    /// Kernel release string from `uname -r`.
    pub kernel: String,
    /// Leading numeric component of the kernel release; 0 if unparsable.
    pub kernel_major: u32,
    pub cpu_cores: usize,
}

impl SystemInfo {
    /// Probe the host. Call this once, at process start.
    pub fn detect(runner: &dyn CommandRunner) -> Result<SystemInfo, DetectError> {
        if std::env::consts::OS != "linux" {
            return Err(DetectError::UnsupportedOs(std::env::consts::OS.to_string()));
        }
        if !nix::unistd::Uid::effective().is_root() {
            return Err(DetectError::NotRoot);
        }

        let arch = match std::env::consts::ARCH {
            "x86_64" => Arch::Amd64,
            "aarch64" => Arch::Arm64,
            _ => Arch::Other,
        };

        let (distro, distro_version, code_name) = query_release_info(runner)?;
        let (kernel, kernel_major) = query_kernel(runner);
        let cpu_cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        let info = SystemInfo {
            os: OsKind::Linux,
            arch,
            distro,
            distro_version,
            code_name,
            kernel,
            kernel_major,
            cpu_cores,
        };
        tracing::debug!(?info, "host facts detected");
        Ok(info)
    }
}

/// Query `lsb_release -a`, bootstrapping the tool if it is missing.
///
/// A missing tool is installed via whichever package manager exists on the
/// host (yum first, then apt) and the query is retried, at most
/// [`BOOTSTRAP_ATTEMPTS`] times. A tool that is present but fails leaves
/// the distro fields empty rather than aborting detection.
fn query_release_info(
    runner: &dyn CommandRunner,
) -> Result<(Distro, String, String), DetectError> {
    for attempt in 1..=BOOTSTRAP_ATTEMPTS {
        match runner.output("lsb_release", &["-a"]) {
            Ok(out) => return Ok(parse_release_info(&out)),
            Err(err) if err.is_not_found() => {
                tracing::warn!(attempt, "lsb_release is missing, installing it");
                if runner.run("yum", &["-y", "install", "redhat-lsb"]).is_err() {
                    let _ = runner.run("apt", &["-y", "install", "lsb-release"]);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "lsb_release failed; distro fields left empty");
                return Ok((Distro::Unknown, String::new(), String::new()));
            }
        }
    }
    Err(DetectError::ReleaseInfoUnavailable {
        attempts: BOOTSTRAP_ATTEMPTS,
    })
}

/// Pull the description and codename out of `lsb_release -a` output.
fn parse_release_info(out: &str) -> (Distro, String, String) {
    let mut description = String::new();
    let mut code_name = String::new();
    for line in out.lines() {
        if let Some(rest) = line.strip_prefix("Description:") {
            description = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("Codename:") {
            code_name = rest.trim().to_string();
        }
    }
    (Distro::from_description(&description), description, code_name)
}

/// Kernel release string and its major version. Either query or parse
/// failing leaves the corresponding field at its zero value.
fn query_kernel(runner: &dyn CommandRunner) -> (String, u32) {
    match runner.output("uname", &["-r"]) {
        Ok(kernel) => {
            let major = kernel
                .split('.')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            (kernel, major)
        }
        Err(_) => (String::new(), 0),
    }
}
