//! kubeprep — provision Linux hosts for containerd and kubeadm clusters.
//!
//! The library is a thin stack: [`runner`] executes external commands,
//! [`sysinfo`] detects the host fact-base, [`artifact`]/[`artifacts`]
//! describe the config files the tool writes, [`pipeline`] sequences steps,
//! and [`commands`] holds one module per CLI domain.

pub mod artifact;
pub mod artifacts;
pub mod cli;
pub mod commands;
pub mod error;
pub mod net;
pub mod output;
pub mod pipeline;
pub mod runner;
pub mod sysinfo;

pub use error::{DetectError, ExecError};
pub use runner::{CommandRunner, StreamingRunner};
pub use sysinfo::SystemInfo;
