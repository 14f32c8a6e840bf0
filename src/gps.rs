//! GPS clock discipline.
//!
//! Waits for a 2-D or better fix from gpsd and, once one arrives, sets the
//! system clock from the fix time and writes it through to the RTC. Runs as
//! its own process; the capture loop only sees the result through later RTC
//! reads.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::process::{CommandRunner, CommandSpec, ProcessOutcome};
use crate::shutdown::Shutdown;

pub const DEFAULT_GPSD_ADDR: &str = "127.0.0.1:2947";
pub const DEFAULT_FIX_TIMEOUT: Duration = Duration::from_secs(120);

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CLOCK_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A time solution from the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpsFix {
    pub time: DateTime<Utc>,
    /// NMEA fix mode: 2 = 2-D, 3 = 3-D.
    pub mode: u8,
}

#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: Option<u8>,
    #[serde(default)]
    time: Option<String>,
}

/// Extract a usable fix from one gpsd JSON line.
pub fn parse_report(line: &str) -> Option<GpsFix> {
    let report: Report = serde_json::from_str(line.trim()).ok()?;
    if report.class != "TPV" {
        return None;
    }
    let mode = report.mode.filter(|mode| *mode >= 2)?;
    let time = parse_gps_time(report.time.as_deref()?)?;
    Some(GpsFix { time, mode })
}

/// Parse gpsd's `YYYY-MM-DDTHH:MM:SS[.fff]Z`.
pub fn parse_gps_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

#[derive(Clone, Debug)]
pub struct GpsSyncSettings {
    pub gpsd_addr: String,
    /// Prefix clock-setting commands with `sudo`.
    pub use_sudo: bool,
    /// Report the fix without touching any clock.
    pub dry_run: bool,
    pub date_program: String,
    pub hwclock_program: String,
}

impl Default for GpsSyncSettings {
    fn default() -> Self {
        Self {
            gpsd_addr: DEFAULT_GPSD_ADDR.to_string(),
            use_sudo: true,
            dry_run: false,
            date_program: "date".to_string(),
            hwclock_program: "hwclock".to_string(),
        }
    }
}

pub struct GpsClockSync {
    settings: GpsSyncSettings,
    runner: Box<dyn CommandRunner>,
    shutdown: Shutdown,
}

impl GpsClockSync {
    pub fn new(settings: GpsSyncSettings, runner: Box<dyn CommandRunner>, shutdown: Shutdown) -> Self {
        Self {
            settings,
            runner,
            shutdown,
        }
    }

    /// Wait up to `timeout` for a fix and discipline both clocks from it.
    ///
    /// Returns the time applied, or None if no fix arrived or the clocks
    /// could not be set.
    pub fn run_once(&mut self, timeout: Duration) -> Option<DateTime<Utc>> {
        log::info!("Looking for GPS fix on {}...", self.settings.gpsd_addr);
        let Some(fix) = self.wait_for_fix(timeout) else {
            log::warn!(
                "Timeout: no GPS fix acquired within {}s; skipping RTC update",
                timeout.as_secs()
            );
            return None;
        };
        log::info!("GPS fix acquired (mode {}): {}", fix.mode, fix.time);

        if self.settings.dry_run {
            log::info!("dry run: leaving system clock and RTC untouched");
            return Some(fix.time);
        }
        match self.discipline(fix.time) {
            Ok(()) => Some(fix.time),
            Err(e) => {
                log::error!("Failed to set time: {:#}", e);
                None
            }
        }
    }

    fn wait_for_fix(&self, timeout: Duration) -> Option<GpsFix> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.is_requested() {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            match self.open_session(remaining) {
                Ok(reader) => match self.read_fix(reader, deadline) {
                    Ok(Some(fix)) => return Some(fix),
                    Ok(None) => log::debug!("gpsd session ended without a fix"),
                    Err(e) => log::warn!("GPS error: {:#}", e),
                },
                Err(e) => log::warn!("GPS error: {:#}", e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.shutdown.wait_timeout(RECONNECT_DELAY.min(remaining)) {
                return None;
            }
        }
    }

    fn open_session(&self, remaining: Duration) -> Result<BufReader<TcpStream>> {
        let addr = self
            .settings
            .gpsd_addr
            .to_socket_addrs()
            .with_context(|| format!("resolve gpsd address {}", self.settings.gpsd_addr))?
            .next()
            .ok_or_else(|| anyhow!("gpsd address {} resolved to nothing", self.settings.gpsd_addr))?;
        let connect_timeout = remaining.min(Duration::from_secs(5)).max(Duration::from_millis(1));
        let mut stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .with_context(|| format!("connect to gpsd at {}", addr))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("set gpsd read timeout")?;
        stream.write_all(WATCH_COMMAND).context("send gpsd WATCH")?;
        Ok(BufReader::new(stream))
    }

    fn read_fix(
        &self,
        mut reader: BufReader<TcpStream>,
        deadline: Instant,
    ) -> Result<Option<GpsFix>> {
        let mut line = String::new();
        while Instant::now() < deadline && !self.shutdown.is_requested() {
            match reader.read_line(&mut line) {
                Ok(0) => return Ok(None),
                Ok(_) if line.ends_with('\n') => {
                    if let Some(fix) = parse_report(&line) {
                        return Ok(Some(fix));
                    }
                    line.clear();
                }
                Ok(_) => {}
                // A partial line stays in `line` and is completed by the next read.
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Err(e).context("read gpsd report"),
            }
        }
        Ok(None)
    }

    fn discipline(&mut self, time: DateTime<Utc>) -> Result<()> {
        let set_date = CommandSpec::new(&self.settings.date_program)
            .arg("-u")
            .arg("-s")
            .arg(time.format("%Y-%m-%d %H:%M:%S").to_string());
        self.run_clock_command(set_date)?;
        log::info!("System time set to: {}", time);

        let write_rtc = CommandSpec::new(&self.settings.hwclock_program).arg("-w");
        self.run_clock_command(write_rtc)?;
        log::info!("RTC time updated from GPS.");
        Ok(())
    }

    fn run_clock_command(&mut self, spec: CommandSpec) -> Result<()> {
        let spec = if self.settings.use_sudo {
            spec.with_sudo()
        } else {
            spec
        };
        match self
            .runner
            .run(&spec, CLOCK_COMMAND_TIMEOUT, &self.shutdown)?
        {
            ProcessOutcome::Exited { code: Some(0), .. } => Ok(()),
            ProcessOutcome::Exited { code, stderr, .. } => Err(anyhow!(
                "`{}` exited with {:?}: {}",
                spec.display(),
                code,
                stderr
            )),
            ProcessOutcome::TimedOut { after } => {
                Err(anyhow!("`{}` timed out after {:?}", spec.display(), after))
            }
            ProcessOutcome::Interrupted => Err(anyhow!("`{}` interrupted", spec.display())),
        }
    }
}
