//! Flash-lit still capture.
//!
//! This module provides:
//! - `CaptureBackend`: one way of producing a JPEG (USB webcam, camera module, stub)
//! - `CaptureController`: the flash/stabilize/capture/release sequence
//! - `CaptureEvent`: the per-cycle pairing of a timestamp with a capture result

mod backend;
pub mod backends;
mod controller;

pub use backend::{BackendKind, CaptureBackend};
pub use backends::{
    CameraModuleBackend, CameraModuleParams, StubBackend, StubBehavior, UsbWebcamBackend,
    UsbWebcamParams,
};
pub use controller::{
    CaptureController, CaptureError, CaptureSettings, FailureReason, ImageArtifact,
    DEFAULT_STABILIZATION,
};

use crate::clock::ClockReading;

/// Coarse classification of a capture attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    Success,
    HardwareFailure,
    Timeout,
    UnexpectedError,
    Interrupted,
}

impl std::fmt::Display for CaptureOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::HardwareFailure => write!(f, "hardware-failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::UnexpectedError => write!(f, "unexpected-error"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// One loop iteration's timestamp and capture result.
#[derive(Clone, Debug)]
pub struct CaptureEvent {
    pub timestamp: ClockReading,
    pub result: Result<ImageArtifact, CaptureError>,
}

impl CaptureEvent {
    pub fn outcome(&self) -> CaptureOutcome {
        match &self.result {
            Ok(_) => CaptureOutcome::Success,
            Err(CaptureError::ProcessFailure { .. }) => CaptureOutcome::HardwareFailure,
            Err(CaptureError::Timeout { .. }) => CaptureOutcome::Timeout,
            Err(CaptureError::UnexpectedError { .. }) => CaptureOutcome::UnexpectedError,
            Err(CaptureError::Interrupted { .. }) => CaptureOutcome::Interrupted,
        }
    }

    pub fn artifact(&self) -> Option<&ImageArtifact> {
        self.result.as_ref().ok()
    }
}

/// Build the configured backend.
pub fn build_backend(
    kind: BackendKind,
    usb_webcam: &UsbWebcamParams,
    camera_module: &CameraModuleParams,
) -> Box<dyn CaptureBackend> {
    match kind {
        BackendKind::UsbWebcam => Box::new(UsbWebcamBackend::new(usb_webcam.clone())),
        BackendKind::CameraModule => Box::new(CameraModuleBackend::new(camera_module.clone())),
        BackendKind::Stub => Box::new(StubBackend::new(StubBehavior::Succeed)),
    }
}
