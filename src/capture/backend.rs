use anyhow::{anyhow, Result};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::process::{CommandRunner, CommandSpec, ProcessOutcome};
use crate::shutdown::Shutdown;

/// Which capture program produces frames. Chosen by configuration only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// USB UVC webcam driven by `fswebcam`.
    UsbWebcam,
    /// Raspberry Pi camera module driven by `rpicam-still`.
    #[default]
    CameraModule,
    /// In-process stand-in that writes a fixed JPEG.
    Stub,
}

impl BackendKind {
    /// Default subprocess bound for this backend.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::UsbWebcam => Duration::from_secs(5),
            Self::CameraModule => Duration::from_secs(10),
            Self::Stub => Duration::from_secs(2),
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "usb-webcam" | "usb_webcam" | "usb" | "fswebcam" => Ok(Self::UsbWebcam),
            "camera-module" | "camera_module" | "picam" | "rpicam" => Ok(Self::CameraModule),
            "stub" => Ok(Self::Stub),
            other => Err(anyhow!(
                "unknown capture backend '{}': expected 'usb-webcam', 'camera-module' or 'stub'",
                other
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UsbWebcam => write!(f, "usb-webcam"),
            Self::CameraModule => write!(f, "camera-module"),
            Self::Stub => write!(f, "stub"),
        }
    }
}

/// A way of producing one JPEG frame on disk.
///
/// Implementations own their image-quality parameters; the controller only
/// sees the command line and the process outcome.
pub trait CaptureBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Command that writes a single JPEG to `output`.
    fn command(&self, output: &Path) -> CommandSpec;

    /// Startup check that this backend can physically capture.
    fn probe(&self) -> Result<()>;

    /// Run one capture into `output`, bounded by `timeout`.
    fn invoke(
        &mut self,
        runner: &mut dyn CommandRunner,
        output: &Path,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<ProcessOutcome> {
        runner.run(&self.command(output), timeout, shutdown)
    }
}
