use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::capture::backend::CaptureBackend;
use crate::process::{find_program, CommandSpec};

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CameraModuleParams {
    pub program: String,
    pub width: u32,
    pub height: u32,
    /// Sensor warm-up before the still is taken (`-t`).
    pub warmup_ms: u64,
    pub extra_args: Vec<String>,
}

impl Default for CameraModuleParams {
    fn default() -> Self {
        Self {
            program: "rpicam-still".to_string(),
            width: 640,
            height: 480,
            warmup_ms: 1000,
            extra_args: Vec::new(),
        }
    }
}

impl CameraModuleParams {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "camera module resolution must be non-zero (got {}x{})",
                self.width,
                self.height
            ));
        }
        Ok(())
    }
}

pub struct CameraModuleBackend {
    params: CameraModuleParams,
}

impl CameraModuleBackend {
    pub fn new(params: CameraModuleParams) -> Self {
        Self { params }
    }
}

impl CaptureBackend for CameraModuleBackend {
    fn name(&self) -> &'static str {
        "camera-module"
    }

    fn command(&self, output: &Path) -> CommandSpec {
        CommandSpec::new(&self.params.program)
            .arg("--width")
            .arg(self.params.width.to_string())
            .arg("--height")
            .arg(self.params.height.to_string())
            .arg("-t")
            .arg(self.params.warmup_ms.to_string())
            .args(self.params.extra_args.iter().cloned())
            .arg("-o")
            .arg(output.to_string_lossy())
    }

    fn probe(&self) -> Result<()> {
        find_program(&self.params.program)
            .map(|_| ())
            .ok_or_else(|| anyhow!("`{}` not found on PATH", self.params.program))
    }
}
