//! photo_logger - the flash-lit capture daemon.
//!
//! Wires configuration into the capture loop and runs it until SIGINT or
//! SIGTERM. A signal that lands during an upload ends the process at once;
//! otherwise the current stage completes and the flash is released first.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use photo_logger::{
    build_backend, on_stop_signal, CaptureController, CaptureLoop, ClockSource, FlashActuator,
    LoggerConfig, NoFlash, Shutdown, SignalAction, SysfsGpioFlash, SystemCommandRunner,
    UploadClient,
};

const SIGNAL_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about = "Flash-lit photo capture and upload loop")]
struct Args {
    /// JSON configuration file. Environment variables override its values.
    #[arg(long, env = "PHOTO_LOGGER_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    /// Stop after this many cycles.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_cycles: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = LoggerConfig::load_from(args.config.as_deref())?;
    if args.once {
        config.max_cycles = Some(1);
    } else if let Some(max) = args.max_cycles {
        config.max_cycles = Some(max);
    }

    log::info!("photo_logger v{}", env!("CARGO_PKG_VERSION"));
    log::info!(
        "backend={} interval={}s endpoint={} dir={}",
        config.capture.backend,
        config.interval.as_secs(),
        config.upload.url,
        config.capture.dir.display()
    );

    let shutdown = Shutdown::new();

    let flash: Box<dyn FlashActuator> = match config.flash.gpio {
        Some(pin) => Box::new(
            SysfsGpioFlash::open(pin, config.flash.active_low)
                .with_context(|| format!("failed to set up flash on GPIO {}", pin))?,
        ),
        None => {
            log::warn!("no flash GPIO configured; capturing without flash");
            Box::new(NoFlash)
        }
    };
    log::info!("[FLASH] using {}", flash.name());

    let backend = build_backend(
        config.capture.backend,
        &config.capture.usb_webcam,
        &config.capture.camera_module,
    );
    backend
        .probe()
        .with_context(|| format!("capture backend {} is not usable", backend.name()))?;

    let controller = CaptureController::new(
        flash,
        backend,
        Box::new(SystemCommandRunner::new()),
        config.capture_settings(),
        shutdown.clone(),
    )?;
    let clock = ClockSource::new(
        Box::new(SystemCommandRunner::new()),
        config.rtc_command()?,
        config.clock.rtc_timeout,
        shutdown.clone(),
    );
    let uploader = UploadClient::new(config.upload_settings()?, shutdown.clone())
        .context("failed to build upload client")?;

    let mut capture_loop = CaptureLoop::new(
        clock,
        controller,
        uploader,
        config.loop_settings(),
        shutdown.clone(),
    );

    let stage = capture_loop.stage_handle();
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting signal handler")?;

    let watcher_shutdown = shutdown.clone();
    thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || {
            while rx.recv().is_ok() {
                let current = stage.get();
                match on_stop_signal(&stage, &watcher_shutdown) {
                    SignalAction::ExitNow => {
                        log::warn!("signal received while {}; exiting now", current);
                        std::process::exit(SIGNAL_EXIT_CODE);
                    }
                    SignalAction::FinishStage => {
                        log::info!("signal received while {}; stopping after this stage", current)
                    }
                }
            }
        })
        .context("failed to spawn signal watcher")?;

    let cycles = capture_loop.run()?;
    log::info!("photo_logger exiting after {} cycle(s)", cycles);
    Ok(())
}
