//! The capture loop.
//!
//! `Idle → Timestamping → Capturing → Uploading → Idle`, one stage at a time
//! on the calling thread. Cycle failures are logged and the loop carries on;
//! only shutdown ends it.

use anyhow::Result;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::{CaptureController, CaptureEvent, CaptureOutcome};
use crate::clock::{ClockReading, ClockSource};
use crate::shutdown::Shutdown;
use crate::transport::{UploadClient, UploadOutcome};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineStage {
    Idle = 0,
    Timestamping = 1,
    Capturing = 2,
    Uploading = 3,
    Stopped = 4,
}

impl PipelineStage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Timestamping,
            2 => Self::Capturing,
            3 => Self::Uploading,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Timestamping => write!(f, "timestamping"),
            Self::Capturing => write!(f, "capturing"),
            Self::Uploading => write!(f, "uploading"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared view of the loop's current stage, readable from the signal handler.
#[derive(Clone, Debug)]
pub struct StageHandle(Arc<AtomicU8>);

impl StageHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PipelineStage::Idle as u8)))
    }

    pub fn get(&self) -> PipelineStage {
        PipelineStage::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, stage: PipelineStage) {
        self.0.store(stage as u8, Ordering::SeqCst);
    }
}

/// What a stop signal does to the running loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalAction {
    /// End the process now. An in-flight upload is abandoned.
    ExitNow,
    /// Let the current stage finish, then stop.
    FinishStage,
}

/// Handle one stop signal.
///
/// During `Uploading`, or on a repeated signal, the caller must exit at once.
/// Otherwise shutdown is requested and the loop winds down on its own.
pub fn on_stop_signal(stage: &StageHandle, shutdown: &Shutdown) -> SignalAction {
    if stage.get() == PipelineStage::Uploading || shutdown.is_requested() {
        return SignalAction::ExitNow;
    }
    shutdown.request();
    SignalAction::FinishStage
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    /// Sleep between the end of one cycle and the start of the next.
    pub interval: Duration,
    /// Stop after this many cycles. None runs until shutdown.
    pub max_cycles: Option<u64>,
    /// Keep JPEGs on disk after the upload attempt.
    pub retain_captures: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_cycles: None,
            retain_captures: true,
        }
    }
}

/// What happened in one cycle.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: ClockReading,
    pub capture: CaptureOutcome,
    /// None when no upload was attempted.
    pub upload: Option<UploadOutcome>,
    pub elapsed: Duration,
}

pub struct CaptureLoop {
    clock: ClockSource,
    controller: CaptureController,
    uploader: UploadClient,
    settings: LoopSettings,
    shutdown: Shutdown,
    stage: StageHandle,
    cycles: u64,
}

impl CaptureLoop {
    pub fn new(
        clock: ClockSource,
        controller: CaptureController,
        uploader: UploadClient,
        settings: LoopSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            clock,
            controller,
            uploader,
            settings,
            shutdown,
            stage: StageHandle::new(),
            cycles: 0,
        }
    }

    pub fn stage_handle(&self) -> StageHandle {
        self.stage.clone()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run cycles until shutdown or `max_cycles`. Returns the cycle count.
    pub fn run(&mut self) -> Result<u64> {
        self.run_with(|_| {})
    }

    /// Like [`CaptureLoop::run`], handing every cycle report to `on_cycle`.
    pub fn run_with<F>(&mut self, mut on_cycle: F) -> Result<u64>
    where
        F: FnMut(&CycleReport),
    {
        while !self.shutdown.is_requested() {
            let report = self.run_cycle();
            on_cycle(&report);

            if report.capture == CaptureOutcome::Interrupted {
                break;
            }
            if let Some(max) = self.settings.max_cycles {
                if self.cycles >= max {
                    break;
                }
            }

            self.stage.set(PipelineStage::Idle);
            if self.shutdown.wait_timeout(self.settings.interval) {
                break;
            }
        }
        self.stop()?;
        Ok(self.cycles)
    }

    /// One `Timestamping → Capturing → Uploading` pass.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let cycle = self.cycles;
        let started = Instant::now();

        self.stage.set(PipelineStage::Timestamping);
        let timestamp = self.clock.resolve_timestamp();
        log::debug!(
            "cycle {}: timestamp {} ({})",
            cycle,
            timestamp.to_iso8601(),
            timestamp.origin()
        );

        self.stage.set(PipelineStage::Capturing);
        let event = CaptureEvent {
            timestamp,
            result: self.controller.capture(),
        };
        let capture = event.outcome();

        let upload = match &event.result {
            Ok(artifact) => {
                // Stage first: a signal after this point exits the process.
                self.stage.set(PipelineStage::Uploading);
                if self.shutdown.is_requested() {
                    log::info!(
                        "[UPLOAD] shutdown requested; not sending {}",
                        artifact.path().display()
                    );
                    return self.report(cycle, started, event.timestamp, capture, None);
                }
                let outcome = self.uploader.deliver(artifact, &event.timestamp);
                if let UploadOutcome::Failed(e) = &outcome {
                    log::warn!("[UPLOAD] failed: {}", e);
                }
                if !self.settings.retain_captures {
                    if let Err(e) = std::fs::remove_file(artifact.path()) {
                        log::warn!("failed to remove {}: {}", artifact.path().display(), e);
                    }
                }
                Some(outcome)
            }
            Err(e) => {
                log::error!("[CAPTURE] cycle {} failed ({}): {}", cycle, capture, e);
                None
            }
        };

        self.report(cycle, started, event.timestamp, capture, upload)
    }

    fn report(
        &self,
        cycle: u64,
        started: Instant,
        timestamp: ClockReading,
        capture: CaptureOutcome,
        upload: Option<UploadOutcome>,
    ) -> CycleReport {
        let report = CycleReport {
            cycle,
            timestamp,
            capture,
            upload,
            elapsed: started.elapsed(),
        };
        log::info!(
            "cycle {} done in {:.2}s: clock={} capture={} upload={}",
            report.cycle,
            report.elapsed.as_secs_f64(),
            report.timestamp.origin(),
            report.capture,
            match &report.upload {
                Some(UploadOutcome::Delivered { status, .. }) => format!("delivered({})", status),
                Some(UploadOutcome::Failed(_)) => "failed".to_string(),
                None => "skipped".to_string(),
            }
        );
        report
    }

    fn stop(&mut self) -> Result<()> {
        self.stage.set(PipelineStage::Stopped);
        log::info!("capture loop stopping after {} cycle(s)", self.cycles);
        self.controller.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_handle_round_trips_every_stage() {
        let handle = StageHandle::new();
        assert_eq!(handle.get(), PipelineStage::Idle);
        for stage in [
            PipelineStage::Timestamping,
            PipelineStage::Capturing,
            PipelineStage::Uploading,
            PipelineStage::Stopped,
            PipelineStage::Idle,
        ] {
            handle.set(stage);
            assert_eq!(handle.get(), stage);
        }
    }

    #[test]
    fn stop_signal_during_upload_exits_now() {
        let stage = StageHandle::new();
        let shutdown = Shutdown::new();
        stage.set(PipelineStage::Uploading);

        assert_eq!(on_stop_signal(&stage, &shutdown), SignalAction::ExitNow);
        assert!(!shutdown.is_requested());
    }

    #[test]
    fn stop_signal_in_other_stages_requests_shutdown() {
        for current in [
            PipelineStage::Idle,
            PipelineStage::Timestamping,
            PipelineStage::Capturing,
        ] {
            let stage = StageHandle::new();
            let shutdown = Shutdown::new();
            stage.set(current);

            assert_eq!(on_stop_signal(&stage, &shutdown), SignalAction::FinishStage);
            assert!(shutdown.is_requested());
        }
    }

    #[test]
    fn second_stop_signal_exits_now() {
        let stage = StageHandle::new();
        let shutdown = Shutdown::new();
        stage.set(PipelineStage::Capturing);

        assert_eq!(on_stop_signal(&stage, &shutdown), SignalAction::FinishStage);
        assert_eq!(on_stop_signal(&stage, &shutdown), SignalAction::ExitNow);
    }

    #[test]
    fn default_settings_match_field_deployment() {
        let settings = LoopSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(30));
        assert!(settings.retain_captures);
        assert!(settings.max_cycles.is_none());
    }
}
