//! Bounded external-process execution.
//!
//! Every interaction with the outside world that goes through a program
//! (`hwclock`, `fswebcam`, `rpicam-still`, `date`) runs through a
//! [`CommandRunner`]. The runner enforces a wall-clock bound, kills the child
//! when the bound expires, and gives up early when shutdown is requested.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::shutdown::Shutdown;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_CAPTURED_OUTPUT: usize = 16 * 1024;
/// Floor on the wait for output once the child has exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(100);

/// Program plus arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build a spec from a whitespace-separated command line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }

    /// Prefix the command with `sudo`.
    pub fn with_sudo(self) -> Self {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: "sudo".to_string(),
            args,
        }
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// How a bounded process run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own. `code` is `None` when it was killed by a signal.
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// The bound expired and the process was killed.
    TimedOut { after: Duration },
    /// Shutdown was requested and the process was killed.
    Interrupted,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0), .. })
    }
}

/// Runs external programs with a wall-clock bound.
pub trait CommandRunner: Send {
    /// Run `spec` to completion, to `timeout`, or until `shutdown` fires.
    ///
    /// Returns `Err` only when the program could not be started at all.
    fn run(
        &mut self,
        spec: &CommandSpec,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<ProcessOutcome>;
}

/// [`CommandRunner`] backed by `std::process`.
#[derive(Clone, Debug)]
pub struct SystemCommandRunner {
    poll_interval: Duration,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(
        &mut self,
        spec: &CommandSpec,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<ProcessOutcome> {
        log::debug!("running `{}` (timeout {:?})", spec.display(), timeout);
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start `{}`", spec.program))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("failed to poll `{}`", spec.program))?
            {
                return Ok(ProcessOutcome::Exited {
                    code: status.code(),
                    stdout: collect(stdout, deadline, &spec.program),
                    stderr: collect(stderr, deadline, &spec.program),
                });
            }

            if shutdown.is_requested() {
                terminate(&mut child, &spec.program);
                return Ok(ProcessOutcome::Interrupted);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                terminate(&mut child, &spec.program);
                return Ok(ProcessOutcome::TimedOut { after: elapsed });
            }

            shutdown.wait_timeout(self.poll_interval.min(timeout - elapsed));
        }
    }
}

/// Resolve `program` against `PATH` the way the shell would.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Forward up to [`MAX_CAPTURED_OUTPUT`] bytes in chunks, then discard the
/// rest so the child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<Vec<u8>>> {
    let mut pipe = pipe?;
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut captured = (&mut pipe).take(MAX_CAPTURED_OUTPUT as u64);
        let mut chunk = [0u8; 4096];
        loop {
            match captured.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);
        let _ = std::io::copy(&mut pipe, &mut std::io::sink());
    });
    Some(rx)
}

/// Output captured so far. A grandchild that inherited the pipe can hold it
/// open past the parent's exit, so the wait ends at `deadline`.
fn collect(rx: Option<Receiver<Vec<u8>>>, deadline: Instant, program: &str) -> String {
    let Some(rx) = rx else {
        return String::new();
    };
    let grace_end = Instant::now() + OUTPUT_GRACE;
    let mut bytes = Vec::new();
    loop {
        let wait = deadline
            .max(grace_end)
            .saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(chunk) => bytes.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Timeout) => {
                log::debug!("`{}` exited but its output is still held open", program);
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    String::from_utf8_lossy(&bytes).trim().to_string()
}

fn terminate(child: &mut Child, program: &str) {
    if let Err(e) = child.kill() {
        log::warn!("failed to kill `{}`: {}", program, e);
    }
    if let Err(e) = child.wait() {
        log::warn!("failed to reap `{}`: {}", program, e);
    }
}
