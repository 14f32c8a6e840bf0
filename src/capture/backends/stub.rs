use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::capture::backend::CaptureBackend;
use crate::process::{CommandRunner, CommandSpec, ProcessOutcome};
use crate::shutdown::Shutdown;

/// Minimal JFIF stream: SOI, APP0 header, EOI.
pub const STUB_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StubBehavior {
    /// Write the frame and exit 0.
    #[default]
    Succeed,
    /// Exit with the given status without writing.
    Fail(i32),
    /// Exit 0 without writing (a backend that lies about success).
    SucceedWithoutFile,
    /// Never finish on its own.
    Hang,
}

/// In-process backend for bench runs without camera hardware.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    behavior: StubBehavior,
    delay: Duration,
}

impl StubBackend {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
        }
    }

    /// Simulated exposure time before the behavior applies.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl CaptureBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn command(&self, output: &Path) -> CommandSpec {
        CommandSpec::new("stub-capture").arg(output.to_string_lossy())
    }

    fn probe(&self) -> Result<()> {
        Ok(())
    }

    fn invoke(
        &mut self,
        _runner: &mut dyn CommandRunner,
        output: &Path,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let wait = match self.behavior {
            StubBehavior::Hang => timeout,
            _ => self.delay.min(timeout),
        };
        if shutdown.wait_timeout(wait) {
            return Ok(ProcessOutcome::Interrupted);
        }
        if self.behavior == StubBehavior::Hang || self.delay > timeout {
            return Ok(ProcessOutcome::TimedOut {
                after: started.elapsed(),
            });
        }

        let code = match self.behavior {
            StubBehavior::Succeed => {
                std::fs::write(output, STUB_JPEG)
                    .with_context(|| format!("stub write {}", output.display()))?;
                0
            }
            StubBehavior::Fail(code) => code,
            StubBehavior::SucceedWithoutFile | StubBehavior::Hang => 0,
        };
        Ok(ProcessOutcome::Exited {
            code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
