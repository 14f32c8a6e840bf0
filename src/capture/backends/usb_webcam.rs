use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::capture::backend::CaptureBackend;
use crate::process::{find_program, CommandSpec};

/// `fswebcam` quality parameters. Values are passed through verbatim as
/// V4L2 control settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UsbWebcamParams {
    pub program: String,
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    pub brightness: String,
    pub contrast: String,
    pub gain: String,
    pub exposure: String,
    pub auto_white_balance: String,
    /// Additional `--set NAME=VALUE` controls.
    pub extra_controls: Vec<String>,
}

impl Default for UsbWebcamParams {
    fn default() -> Self {
        Self {
            program: "fswebcam".to_string(),
            device: PathBuf::from("/dev/video0"),
            width: 1280,
            height: 640,
            jpeg_quality: 95,
            brightness: "85%".to_string(),
            contrast: "60%".to_string(),
            gain: "210".to_string(),
            exposure: "Auto".to_string(),
            auto_white_balance: "1".to_string(),
            extra_controls: Vec::new(),
        }
    }
}

impl UsbWebcamParams {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "usb webcam resolution must be non-zero (got {}x{})",
                self.width,
                self.height
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!(
                "usb webcam jpeg quality must be 1..=100 (got {})",
                self.jpeg_quality
            ));
        }
        Ok(())
    }

    fn controls(&self) -> Vec<String> {
        let mut controls = vec![
            format!("Brightness={}", self.brightness),
            format!("Contrast={}", self.contrast),
            format!("Gain={}", self.gain),
            format!("Exposure={}", self.exposure),
            format!("White Balance Temperature, Auto={}", self.auto_white_balance),
        ];
        controls.extend(self.extra_controls.iter().cloned());
        controls
    }
}

pub struct UsbWebcamBackend {
    params: UsbWebcamParams,
}

impl UsbWebcamBackend {
    pub fn new(params: UsbWebcamParams) -> Self {
        Self { params }
    }
}

impl CaptureBackend for UsbWebcamBackend {
    fn name(&self) -> &'static str {
        "usb-webcam"
    }

    fn command(&self, output: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.params.program)
            .arg("-d")
            .arg(self.params.device.to_string_lossy())
            .arg("-r")
            .arg(format!("{}x{}", self.params.width, self.params.height))
            .arg("--jpeg")
            .arg(self.params.jpeg_quality.to_string())
            .arg("--no-banner");
        for control in self.params.controls() {
            spec = spec.arg("--set").arg(control);
        }
        spec.arg(output.to_string_lossy())
    }

    fn probe(&self) -> Result<()> {
        find_program(&self.params.program)
            .ok_or_else(|| anyhow!("`{}` not found on PATH", self.params.program))?;
        if !self.params.device.exists() {
            return Err(anyhow!(
                "webcam device {} not present",
                self.params.device.display()
            ));
        }
        Ok(())
    }
}
