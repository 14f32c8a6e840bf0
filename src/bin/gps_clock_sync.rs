//! gps_clock_sync - set the system clock and RTC from a gpsd fix.
//!
//! Usually run once at boot before `photo_logger` starts. With
//! `--loop-every` it keeps re-disciplining the clock until signalled.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use photo_logger::gps::{DEFAULT_FIX_TIMEOUT, DEFAULT_GPSD_ADDR};
use photo_logger::{GpsClockSync, GpsSyncSettings, Shutdown, SystemCommandRunner};

#[derive(Parser, Debug)]
#[command(author, version, about = "Discipline the system clock and RTC from GPS")]
struct Args {
    /// gpsd address.
    #[arg(long, env = "GPSD_ADDR", default_value = DEFAULT_GPSD_ADDR)]
    gpsd_addr: String,

    /// Seconds to wait for a 2-D or better fix.
    #[arg(long, env = "GPS_TIMEOUT_SECS", default_value_t = DEFAULT_FIX_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Run `date` and `hwclock` directly instead of through sudo.
    #[arg(long)]
    no_sudo: bool,

    /// Report the fix without setting any clock.
    #[arg(long)]
    dry_run: bool,

    /// Repeat every N seconds instead of exiting after one attempt.
    #[arg(long)]
    loop_every: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let shutdown = Shutdown::new();
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting signal handler")?;
    let watcher_shutdown = shutdown.clone();
    thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || {
            if rx.recv().is_ok() {
                log::info!("signal received; stopping");
                watcher_shutdown.request();
            }
        })
        .context("failed to spawn signal watcher")?;

    let settings = GpsSyncSettings {
        gpsd_addr: args.gpsd_addr,
        use_sudo: !args.no_sudo,
        dry_run: args.dry_run,
        ..GpsSyncSettings::default()
    };
    let mut sync = GpsClockSync::new(
        settings,
        Box::new(SystemCommandRunner::new()),
        shutdown.clone(),
    );
    let timeout = Duration::from_secs(args.timeout_secs.max(1));

    match args.loop_every {
        None => {
            if sync.run_once(timeout).is_none() && !shutdown.is_requested() {
                std::process::exit(1);
            }
        }
        Some(every) => {
            let every = Duration::from_secs(every.max(1));
            while !shutdown.is_requested() {
                sync.run_once(timeout);
                if shutdown.wait_timeout(every) {
                    break;
                }
            }
        }
    }
    Ok(())
}
