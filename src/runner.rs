//! External command execution with live, non-deadlocking output capture.
//!
//! All provisioning work funnels through the [`CommandRunner`] trait so that
//! pipelines can be exercised in-process without spawning anything.
//!
//! # Production Usage
//!
//! [`StreamingRunner`] spawns the child with the caller's stdin attached and
//! both output pipes drained on dedicated threads. A child that fills either
//! OS pipe buffer while nobody reads it blocks forever, so the two drains run
//! concurrently with the process itself, and the call returns only after the
//! process has exited *and* both drains have hit end-of-stream.
//!
//! # Testing Usage
//!
//! [`MockRunner`] records every call and serves canned stdout per command
//! line, enabling fast, deterministic tests of the pipelines.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ExecError;

/// Bytes copied per read before being flushed to the console.
const CHUNK_SIZE: usize = 4096;

/// Poll interval while waiting on a deadline-bounded child.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Trait for abstracting external command execution.
pub trait CommandRunner: Send + Sync {
    /// Run a command, echoing its output live to the console.
    ///
    /// Stdin is inherited from the calling process (interactive prompts such
    /// as `cp -i` keep working). `Ok(())` only for a zero exit code.
    fn run(&self, program: &str, args: &[&str]) -> Result<(), ExecError>;

    /// Run a command quietly and return its trimmed stdout.
    ///
    /// Used by parse-and-branch call sites (`lsb_release`, `apt-cache
    /// madison`, `kubeadm token create`). A non-zero exit carries the
    /// child's stderr in the error.
    fn output(&self, program: &str, args: &[&str]) -> Result<String, ExecError>;

    /// Run a shell command line through `/bin/bash -c`.
    ///
    /// For the handful of steps that genuinely need shell pipes.
    fn shell(&self, command: &str) -> Result<(), ExecError> {
        self.run("/bin/bash", &["-c", command])
    }

    /// Capture the stdout of a shell command line.
    fn shell_output(&self, command: &str) -> Result<String, ExecError> {
        self.output("/bin/bash", &["-c", command])
    }
}

/// Production runner backed by [`std::process::Command`].
#[derive(Debug, Default)]
pub struct StreamingRunner {
    /// Wall-clock limit for a single command. `None` waits forever, which
    /// is the default: a hung package manager is an operator problem, not
    /// something to paper over with an arbitrary cutoff.
    pub deadline: Option<Duration>,
}

impl StreamingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner that kills any command still running after `deadline`.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }
}

impl CommandRunner for StreamingRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), ExecError> {
        tracing::debug!(program, ?args, "spawning");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ExecError::Stream {
            program: program.to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ExecError::Stream {
            program: program.to_string(),
        })?;

        let out_reader = thread::spawn(move || drain(stdout, io::stdout()));
        let err_reader = thread::spawn(move || drain(stderr, io::stderr()));

        let status = match self.deadline {
            Some(limit) => wait_with_deadline(&mut child, program, limit),
            None => child.wait().map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            }),
        };

        // Join both readers even on failure so trailing output is never
        // truncated and the threads do not outlive the call.
        let _ = out_reader.join();
        let _ = err_reader.join();

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failed {
                program: program.to_string(),
                status,
                stderr: String::new(),
            })
        }
    }

    fn output(&self, program: &str, args: &[&str]) -> Result<String, ExecError> {
        tracing::debug!(program, ?args, "capturing");

        let out = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !out.status.success() {
            return Err(ExecError::Failed {
                program: program.to_string(),
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

/// Copy a child's pipe to the console in bounded chunks until end-of-stream,
/// flushing after every chunk so output appears as it is produced.
///
/// Returns the number of bytes copied.
fn drain(mut reader: impl Read, mut writer: impl Write) -> u64 {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = writer.flush();
                total += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    total
}

fn wait_with_deadline(
    child: &mut Child,
    program: &str,
    limit: Duration,
) -> Result<ExitStatus, ExecError> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(source) => {
                return Err(ExecError::Spawn {
                    program: program.to_string(),
                    source,
                })
            }
        }
        if start.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExecError::Timeout {
                program: program.to_string(),
                secs: limit.as_secs(),
            });
        }
        thread::sleep(WAIT_POLL);
    }
}

// ============================================================================
// Mock runner for tests
// ============================================================================

/// Test double that records all calls and serves canned responses.
///
/// Canned stdout is keyed by the rendered command line (program followed by
/// its arguments, space-separated). `output` calls with no canned entry fail
/// as if the program were missing, which doubles as a way to simulate absent
/// tools. `run` calls succeed unless a failure point is armed.
#[derive(Default)]
pub struct MockRunner {
    calls: Mutex<Vec<String>>,
    outputs: Mutex<HashMap<String, String>>,
    fail_from: Option<usize>,
    fail_only: Option<usize>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `stdout` for the exact command line `cmdline`.
    pub fn with_output(self, cmdline: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.outputs
            .lock()
            .unwrap()
            .insert(cmdline.into(), stdout.into());
        self
    }

    /// Fail every call starting with the `n`-th (1-based).
    pub fn fail_from(mut self, n: usize) -> Self {
        self.fail_from = Some(n);
        self
    }

    /// Fail only the `n`-th call (1-based).
    pub fn fail_only(mut self, n: usize) -> Self {
        self.fail_only = Some(n);
        self
    }

    /// Every command line seen so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, program: &str, args: &[&str]) -> (String, usize) {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(line.clone());
        (line, calls.len())
    }

    fn should_fail(&self, nth: usize) -> bool {
        self.fail_from.is_some_and(|n| nth >= n) || self.fail_only.is_some_and(|n| nth == n)
    }

    fn failed(program: &str) -> ExecError {
        use std::os::unix::process::ExitStatusExt;
        ExecError::Failed {
            program: program.to_string(),
            status: ExitStatus::from_raw(1 << 8),
            stderr: String::new(),
        }
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), ExecError> {
        let (_, nth) = self.record(program, args);
        if self.should_fail(nth) {
            return Err(Self::failed(program));
        }
        Ok(())
    }

    fn output(&self, program: &str, args: &[&str]) -> Result<String, ExecError> {
        let (line, nth) = self.record(program, args);
        if self.should_fail(nth) {
            return Err(Self::failed(program));
        }
        match self.outputs.lock().unwrap().get(&line) {
            Some(stdout) => Ok(stdout.trim().to_string()),
            None => Err(ExecError::Spawn {
                program: program.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no canned output"),
            }),
        }
    }
}
