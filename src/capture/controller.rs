use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::backend::CaptureBackend;
use crate::flash::{FlashActuator, FlashGuard};
use crate::process::{CommandRunner, ProcessOutcome};
use crate::shutdown::Shutdown;

pub const DEFAULT_STABILIZATION: Duration = Duration::from_millis(700);

const STDERR_EXCERPT_CHARS: usize = 512;

/// A JPEG written by a successful capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageArtifact {
    path: PathBuf,
    backend: &'static str,
}

impl ImageArtifact {
    pub fn new(path: PathBuf, backend: &'static str) -> Self {
        Self { path, backend }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "capture.jpg".to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    NonZeroExit,
    /// Exit status 0 but no file on disk.
    MissingOutput,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureError {
    /// The capture program exceeded its bound and was killed.
    Timeout {
        backend: &'static str,
        after: Duration,
    },
    ProcessFailure {
        backend: &'static str,
        exit_code: Option<i32>,
        reason: FailureReason,
        stderr: String,
    },
    UnexpectedError {
        backend: &'static str,
        message: String,
    },
    /// Shutdown arrived mid-capture.
    Interrupted { backend: &'static str },
}

impl CaptureError {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Timeout { backend, .. }
            | Self::ProcessFailure { backend, .. }
            | Self::UnexpectedError { backend, .. }
            | Self::Interrupted { backend } => backend,
        }
    }
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { backend, after } => {
                write!(f, "{} capture timed out after {:.1}s", backend, after.as_secs_f64())
            }
            Self::ProcessFailure {
                backend,
                exit_code,
                reason: FailureReason::MissingOutput,
                ..
            } => write!(
                f,
                "{} reported exit status {:?} but wrote no output file",
                backend, exit_code
            ),
            Self::ProcessFailure {
                backend,
                exit_code: Some(code),
                stderr,
                ..
            } => write!(f, "{} failed with return code {}: {}", backend, code, stderr),
            Self::ProcessFailure {
                backend, stderr, ..
            } => write!(f, "{} terminated by signal: {}", backend, stderr),
            Self::UnexpectedError { backend, message } => {
                write!(f, "unexpected {} capture error: {}", backend, message)
            }
            Self::Interrupted { backend } => write!(f, "{} capture interrupted by shutdown", backend),
        }
    }
}

impl std::error::Error for CaptureError {}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Directory that receives `%Y%m%d_%H%M%S.jpg` files.
    pub dir: PathBuf,
    /// Flash-on hold before the capture program starts.
    pub stabilization: Duration,
    /// Bound on the capture program.
    pub timeout: Duration,
}

/// Sole owner of the flash and the camera backend.
pub struct CaptureController {
    flash: Box<dyn FlashActuator>,
    backend: Box<dyn CaptureBackend>,
    runner: Box<dyn CommandRunner>,
    settings: CaptureSettings,
    shutdown: Shutdown,
}

impl CaptureController {
    pub fn new(
        flash: Box<dyn FlashActuator>,
        backend: Box<dyn CaptureBackend>,
        runner: Box<dyn CommandRunner>,
        settings: CaptureSettings,
        shutdown: Shutdown,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.dir).with_context(|| {
            format!("failed to create capture dir {}", settings.dir.display())
        })?;
        Ok(Self {
            flash,
            backend,
            runner,
            settings,
            shutdown,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Flash on, settle, run the backend, flash off.
    ///
    /// The flash is de-energized before this returns, whatever the outcome.
    pub fn capture(&mut self) -> Result<ImageArtifact, CaptureError> {
        let Self {
            flash,
            backend,
            runner,
            settings,
            shutdown,
        } = self;
        let name = backend.name();
        if shutdown.is_requested() {
            return Err(CaptureError::Interrupted { backend: name });
        }

        let output = next_output_path(&settings.dir).map_err(|e| CaptureError::UnexpectedError {
            backend: name,
            message: format!("{:#}", e),
        })?;

        let result = {
            let _lit = FlashGuard::energize(&mut **flash).map_err(|e| {
                CaptureError::UnexpectedError {
                    backend: name,
                    message: format!("flash energize failed: {:#}", e),
                }
            })?;
            expose(&mut **backend, &mut **runner, settings, shutdown, &output)
        };

        match &result {
            Ok(artifact) => log::info!("[CAPTURE] Photo saved to {}", artifact.path().display()),
            Err(_) => discard_partial(&output),
        }
        result
    }

    /// De-energize and hand the flash line back. Called once on exit.
    pub fn release(&mut self) -> Result<()> {
        self.flash.release()
    }
}

fn expose(
    backend: &mut dyn CaptureBackend,
    runner: &mut dyn CommandRunner,
    settings: &CaptureSettings,
    shutdown: &Shutdown,
    output: &Path,
) -> Result<ImageArtifact, CaptureError> {
    let name = backend.name();
    if shutdown.wait_timeout(settings.stabilization) {
        return Err(CaptureError::Interrupted { backend: name });
    }

    let outcome = backend
        .invoke(runner, output, settings.timeout, shutdown)
        .map_err(|e| CaptureError::UnexpectedError {
            backend: name,
            message: format!("{:#}", e),
        })?;

    match outcome {
        ProcessOutcome::Exited { code: Some(0), .. } if output.is_file() => {
            Ok(ImageArtifact::new(output.to_path_buf(), name))
        }
        ProcessOutcome::Exited { code, stderr, .. } => Err(CaptureError::ProcessFailure {
            backend: name,
            exit_code: code,
            reason: if code == Some(0) {
                FailureReason::MissingOutput
            } else {
                FailureReason::NonZeroExit
            },
            stderr: excerpt(&stderr),
        }),
        ProcessOutcome::TimedOut { after } => Err(CaptureError::Timeout {
            backend: name,
            after,
        }),
        ProcessOutcome::Interrupted => Err(CaptureError::Interrupted { backend: name }),
    }
}

fn next_output_path(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create capture dir {}", dir.display()))?;
    let stem = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let mut candidate = dir.join(format!("{}.jpg", stem));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.jpg", stem, n));
        n += 1;
    }
    Ok(candidate)
}

fn discard_partial(output: &Path) {
    if output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            log::warn!("failed to remove partial capture {}: {}", output.display(), e);
        }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(STDERR_EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn output_paths_do_not_collide_within_one_second() -> Result<()> {
        let dir = tempdir()?;
        let first = next_output_path(dir.path())?;
        std::fs::write(&first, b"x")?;
        let second = next_output_path(dir.path())?;
        assert_ne!(first, second);
        assert_eq!(second.extension().and_then(|e| e.to_str()), Some("jpg"));
        Ok(())
    }

    #[test]
    fn display_includes_backend_and_exit_status() {
        let err = CaptureError::ProcessFailure {
            backend: "usb-webcam",
            exit_code: Some(1),
            reason: FailureReason::NonZeroExit,
            stderr: "no such device".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "usb-webcam failed with return code 1: no such device"
        );

        let missing = CaptureError::ProcessFailure {
            backend: "camera-module",
            exit_code: Some(0),
            reason: FailureReason::MissingOutput,
            stderr: String::new(),
        };
        assert!(missing.to_string().contains("no output file"));
        assert_eq!(missing.backend(), "camera-module");
    }
}
