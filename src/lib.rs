//! Flash-lit photo logger.
//!
//! A field unit that, on a fixed cadence, fires a flash, captures one JPEG
//! from an attached camera, stamps it with the best available clock and
//! posts it to a remote collector. A companion tool disciplines the
//! hardware RTC from a GPS receiver so timestamps stay trustworthy across
//! power loss and missing network time.
//!
//! # Architecture
//!
//! The unit holds three invariants by construction:
//!
//! 1. **Flash released**: the flash is de-energized on every capture path,
//!    including failure and timeout, because it is only ever on inside a
//!    scoped guard.
//! 2. **Bounded externals**: every external program runs under a timeout,
//!    so no cycle can hang.
//! 3. **Never stop for a bad cycle**: capture and upload failures are
//!    logged and the loop proceeds; only shutdown ends it.
//!
//! # Module Structure
//!
//! - `clock`: RTC-first timestamp resolution with system fallback
//! - `gps`: GPS fix acquisition and clock discipline
//! - `flash`: flash actuators and the energize guard
//! - `capture`: camera backends and the capture controller
//! - `transport`: multipart upload over rustls
//! - `pipeline`: the capture loop state machine
//! - `process`: bounded subprocess execution
//! - `shutdown`: cooperative shutdown signal
//! - `config`: file + environment configuration

pub mod capture;
pub mod clock;
pub mod config;
pub mod flash;
pub mod gps;
pub mod pipeline;
pub mod process;
pub mod shutdown;
pub mod transport;

pub use capture::{
    build_backend, BackendKind, CaptureBackend, CaptureController, CaptureError, CaptureEvent,
    CaptureOutcome, CaptureSettings, ImageArtifact,
};
pub use clock::{ClockOrigin, ClockReading, ClockSource};
pub use config::LoggerConfig;
pub use flash::{FlashActuator, FlashGuard, NoFlash, SysfsGpioFlash};
pub use gps::{GpsClockSync, GpsFix, GpsSyncSettings};
pub use pipeline::{
    on_stop_signal, CaptureLoop, CycleReport, LoopSettings, PipelineStage, SignalAction,
    StageHandle,
};
pub use process::{CommandRunner, CommandSpec, ProcessOutcome, SystemCommandRunner};
pub use shutdown::Shutdown;
pub use transport::{UploadClient, UploadError, UploadOutcome, UploadSettings};
