//! Custom error types for kubeprep.
//!
//! Leaf errors are typed with `thiserror`; the command layer wraps them
//! with `anyhow` context on the way up.

use std::process::ExitStatus;
use thiserror::Error;

/// Failure modes of a single external command invocation.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Pipe setup failed after spawn. Unretryable: without both pipes the
    /// child cannot be drained safely.
    #[error("could not open the output streams of '{program}'")]
    Stream { program: String },

    #[error("'{program}' {status}{}", if .stderr.is_empty() { String::new() } else { format!(": {}", .stderr) })]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("'{program}' did not finish within {secs}s and was killed")]
    Timeout { program: String, secs: u64 },
}

impl ExecError {
    /// True when the program itself was not found on the host.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Failure modes of host capability detection. All of these are fatal:
/// no provisioning step runs without a fact-base.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unsupported operating system '{0}': Linux is required")]
    UnsupportedOs(String),

    #[error("root privilege is required to run kubeprep")]
    NotRoot,

    #[error("release information is unavailable: lsb_release could not be installed after {attempts} attempts")]
    ReleaseInfoUnavailable { attempts: u32 },
}
