//! Capture timestamp resolution.
//!
//! The hardware RTC is the preferred source; it survives power loss and is
//! disciplined by `gps_clock_sync`. When it cannot be read the system wall
//! clock is used instead and the reading is tagged accordingly.

use chrono::{DateTime, Local, NaiveDateTime};
use std::time::Duration;

use crate::process::{CommandRunner, CommandSpec, ProcessOutcome};
use crate::shutdown::Shutdown;

pub const DEFAULT_RTC_COMMAND: &str = "hwclock -r";
pub const DEFAULT_RTC_TIMEOUT: Duration = Duration::from_secs(3);

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockOrigin {
    HardwareRtc,
    SystemFallback,
}

impl std::fmt::Display for ClockOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardwareRtc => write!(f, "hardware-rtc"),
            Self::SystemFallback => write!(f, "system-fallback"),
        }
    }
}

/// A resolved wall-clock value and where it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClockReading {
    value: NaiveDateTime,
    origin: ClockOrigin,
}

impl ClockReading {
    pub fn new(value: NaiveDateTime, origin: ClockOrigin) -> Self {
        Self { value, origin }
    }

    pub fn system_now() -> Self {
        Self::new(Local::now().naive_local(), ClockOrigin::SystemFallback)
    }

    pub fn value(&self) -> NaiveDateTime {
        self.value
    }

    pub fn origin(&self) -> ClockOrigin {
        self.origin
    }

    /// Local time in ISO-8601 with microsecond precision.
    pub fn to_iso8601(&self) -> String {
        self.value.format(ISO_FORMAT).to_string()
    }
}

/// The RTC could not be read. Only ever logged.
#[derive(Clone, Debug)]
pub struct ClockUnavailable {
    pub reason: String,
}

impl std::fmt::Display for ClockUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "clock unavailable: {}", self.reason)
    }
}

impl std::error::Error for ClockUnavailable {}

pub struct ClockSource {
    runner: Box<dyn CommandRunner>,
    rtc_command: CommandSpec,
    timeout: Duration,
    shutdown: Shutdown,
}

impl ClockSource {
    pub fn new(
        runner: Box<dyn CommandRunner>,
        rtc_command: CommandSpec,
        timeout: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            runner,
            rtc_command,
            timeout,
            shutdown,
        }
    }

    /// Best available timestamp. Never fails.
    pub fn resolve_timestamp(&mut self) -> ClockReading {
        match self.read_rtc() {
            Ok(value) => ClockReading::new(value, ClockOrigin::HardwareRtc),
            Err(e) => {
                log::warn!("[CLOCK] {}; using system clock", e);
                ClockReading::system_now()
            }
        }
    }

    fn read_rtc(&mut self) -> Result<NaiveDateTime, ClockUnavailable> {
        let outcome = self
            .runner
            .run(&self.rtc_command, self.timeout, &self.shutdown)
            .map_err(|e| ClockUnavailable {
                reason: format!("{:#}", e),
            })?;
        let stdout = match outcome {
            ProcessOutcome::Exited {
                code: Some(0),
                stdout,
                ..
            } => stdout,
            ProcessOutcome::Exited { code, stderr, .. } => {
                return Err(ClockUnavailable {
                    reason: format!(
                        "`{}` exited with {:?}: {}",
                        self.rtc_command.display(),
                        code,
                        stderr
                    ),
                })
            }
            ProcessOutcome::TimedOut { after } => {
                return Err(ClockUnavailable {
                    reason: format!(
                        "`{}` timed out after {:?}",
                        self.rtc_command.display(),
                        after
                    ),
                })
            }
            ProcessOutcome::Interrupted => {
                return Err(ClockUnavailable {
                    reason: "rtc read interrupted by shutdown".to_string(),
                })
            }
        };
        parse_rtc_output(&stdout).ok_or_else(|| ClockUnavailable {
            reason: format!("unparsable rtc output {:?}", stdout),
        })
    }
}

/// Parse `hwclock -r` output into local time.
///
/// Accepts `YYYY-MM-DD HH:MM:SS`, an optional fractional part, and the
/// trailing UTC offset printed by newer util-linux releases.
pub fn parse_rtc_output(output: &str) -> Option<NaiveDateTime> {
    let text = output.lines().next()?.trim();
    if let Ok(with_offset) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(with_offset.with_timezone(&Local).naive_local());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use chrono::{NaiveDate, Timelike};

    struct FixedRunner(Option<ProcessOutcome>);

    impl CommandRunner for FixedRunner {
        fn run(
            &mut self,
            _spec: &CommandSpec,
            _timeout: Duration,
            _shutdown: &Shutdown,
        ) -> Result<ProcessOutcome> {
            self.0.clone().ok_or_else(|| anyhow!("no such program"))
        }
    }

    fn source(outcome: Option<ProcessOutcome>) -> ClockSource {
        ClockSource::new(
            Box::new(FixedRunner(outcome)),
            CommandSpec::new("hwclock").arg("-r"),
            DEFAULT_RTC_TIMEOUT,
            Shutdown::new(),
        )
    }

    fn exited(code: i32, stdout: &str) -> Option<ProcessOutcome> {
        Some(ProcessOutcome::Exited {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    #[test]
    fn parses_plain_and_fractional_rtc_output() {
        let plain = parse_rtc_output("2025-03-14 09:26:53\n").expect("plain");
        assert_eq!(
            plain,
            NaiveDate::from_ymd_opt(2025, 3, 14)
                .and_then(|d| d.and_hms_opt(9, 26, 53))
                .expect("date")
        );

        let fractional = parse_rtc_output("2025-03-14 09:26:53.589793").expect("fractional");
        assert_eq!(fractional.nanosecond(), 589_793_000);
    }

    #[test]
    fn parses_offset_rtc_output() {
        let parsed = parse_rtc_output("2025-03-14 09:26:53.589793+00:00").expect("offset");
        let expected = DateTime::parse_from_rfc3339("2025-03-14T09:26:53.589793+00:00")
            .expect("rfc3339")
            .with_timezone(&Local)
            .naive_local();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn rejects_garbage_rtc_output() {
        assert!(parse_rtc_output("").is_none());
        assert!(parse_rtc_output("hwclock: Cannot access the Hardware Clock").is_none());
    }

    #[test]
    fn rtc_reading_is_tagged_hardware() {
        let reading = source(exited(0, "2025-03-14 09:26:53.500000")).resolve_timestamp();
        assert_eq!(reading.origin(), ClockOrigin::HardwareRtc);
        assert_eq!(reading.to_iso8601(), "2025-03-14T09:26:53.500000");
    }

    #[test]
    fn missing_rtc_command_falls_back_to_system_clock() {
        let reading = source(None).resolve_timestamp();
        assert_eq!(reading.origin(), ClockOrigin::SystemFallback);
    }

    #[test]
    fn failing_or_hung_rtc_falls_back_to_system_clock() {
        let failing = source(exited(1, "")).resolve_timestamp();
        assert_eq!(failing.origin(), ClockOrigin::SystemFallback);

        let garbage = source(exited(0, "not a date")).resolve_timestamp();
        assert_eq!(garbage.origin(), ClockOrigin::SystemFallback);

        let hung = source(Some(ProcessOutcome::TimedOut {
            after: DEFAULT_RTC_TIMEOUT,
        }))
        .resolve_timestamp();
        assert_eq!(hung.origin(), ClockOrigin::SystemFallback);
    }

    #[test]
    fn iso8601_always_carries_subsecond_precision() {
        let value = NaiveDate::from_ymd_opt(2024, 1, 2)
            .and_then(|d| d.and_hms_opt(3, 4, 5))
            .expect("date");
        let reading = ClockReading::new(value, ClockOrigin::SystemFallback);
        assert_eq!(reading.to_iso8601(), "2024-01-02T03:04:05.000000");
        assert_eq!(ClockOrigin::SystemFallback.to_string(), "system-fallback");
    }
}
