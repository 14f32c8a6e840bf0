//! Flash actuator control.
//!
//! The flash is a single GPIO output. [`FlashGuard`] is the only way the
//! capture path turns it on: dropping the guard turns it off again, on every
//! exit path.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";
const EXPORT_SETTLE: Duration = Duration::from_secs(1);
/// Labels of the gpiochip carrying the SoC header pins.
const SOC_CHIP_LABELS: [&str; 2] = ["pinctrl-bcm", "pinctrl-rp1"];

pub trait FlashActuator: Send {
    /// Identifier used in logs (e.g. `gpio5`).
    fn name(&self) -> String;

    fn energize(&mut self) -> Result<()>;

    fn de_energize(&mut self) -> Result<()>;

    /// Leave the line de-energized and give it back to the system.
    fn release(&mut self) -> Result<()> {
        self.de_energize()
    }
}

/// Energized-for-scope handle over a [`FlashActuator`].
pub struct FlashGuard<'a> {
    actuator: &'a mut dyn FlashActuator,
}

impl<'a> FlashGuard<'a> {
    pub fn energize(actuator: &'a mut dyn FlashActuator) -> Result<Self> {
        log::info!("[FLASH] {} ON", actuator.name());
        if let Err(e) = actuator.energize() {
            // A half-applied write may have driven the line; force it back.
            if let Err(release) = actuator.de_energize() {
                log::error!("[FLASH] {} release after failed energize: {}", actuator.name(), release);
            }
            return Err(e);
        }
        Ok(Self { actuator })
    }
}

impl Drop for FlashGuard<'_> {
    fn drop(&mut self) {
        log::info!("[FLASH] {} OFF", self.actuator.name());
        if let Err(e) = self.actuator.de_energize() {
            log::error!("[FLASH] failed to de-energize {}: {:#}", self.actuator.name(), e);
        }
    }
}

/// Flash on a sysfs GPIO line (`/sys/class/gpio/gpioN`).
///
/// `pin` is the BCM number; `line` is the sysfs number, offset by the base
/// of the SoC gpiochip (512 on recent kernels).
pub struct SysfsGpioFlash {
    pin: u32,
    line: u32,
    active_low: bool,
    root: PathBuf,
    exported_here: bool,
}

impl SysfsGpioFlash {
    /// Export `pin` as an output, initially de-energized.
    ///
    /// `active_low` means the flash lights when the line is driven low.
    pub fn open(pin: u32, active_low: bool) -> Result<Self> {
        Self::open_at(SYSFS_GPIO_ROOT, pin, active_low)
    }

    pub fn open_at(root: impl AsRef<Path>, pin: u32, active_low: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let line = pin + soc_gpio_base(&root);
        let line_dir = root.join(format!("gpio{}", line));
        let mut exported_here = false;
        if !line_dir.exists() {
            std::fs::write(root.join("export"), line.to_string())
                .with_context(|| format!("failed to export GPIO {} (sysfs {})", pin, line))?;
            exported_here = true;
        }

        let flash = Self {
            pin,
            line,
            active_low,
            root,
            exported_here,
        };
        flash.configure_output()?;
        log::info!(
            "flash ready on GPIO {} (sysfs gpio{}, active {})",
            pin,
            line,
            if active_low { "low" } else { "high" }
        );
        Ok(flash)
    }

    fn line_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.line))
    }

    fn level(&self, energized: bool) -> &'static str {
        if energized != self.active_low {
            "1"
        } else {
            "0"
        }
    }

    fn configure_output(&self) -> Result<()> {
        // "high"/"low" set direction and initial level in one write, so the
        // line never glitches to the energized level.
        let initial = if self.level(false) == "1" { "high" } else { "low" };
        let direction = self.line_dir().join("direction");

        // udev may still be fixing permissions right after export.
        let deadline = Instant::now() + EXPORT_SETTLE;
        loop {
            match std::fs::write(&direction, initial) {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() < deadline => {
                    log::debug!("waiting for GPIO {} direction: {}", self.pin, e);
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(anyhow!(
                        "failed to set GPIO {} as output ({}): {}",
                        self.pin,
                        direction.display(),
                        e
                    ))
                }
            }
        }
    }

    fn write_level(&self, energized: bool) -> Result<()> {
        let value = self.line_dir().join("value");
        std::fs::write(&value, self.level(energized))
            .with_context(|| format!("failed to write {}", value.display()))
    }
}

impl FlashActuator for SysfsGpioFlash {
    fn name(&self) -> String {
        format!("gpio{}", self.pin)
    }

    fn energize(&mut self) -> Result<()> {
        self.write_level(true)
    }

    fn de_energize(&mut self) -> Result<()> {
        self.write_level(false)
    }

    fn release(&mut self) -> Result<()> {
        self.de_energize()?;
        if self.exported_here {
            std::fs::write(self.root.join("unexport"), self.line.to_string())
                .with_context(|| format!("failed to unexport GPIO {}", self.pin))?;
            self.exported_here = false;
        }
        Ok(())
    }
}

/// Base of the SoC gpiochip under `root`, or 0 when none is listed.
fn soc_gpio_base(root: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    for entry in entries.flatten() {
        let chip = entry.path();
        let is_chip = chip
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("gpiochip"));
        if !is_chip {
            continue;
        }
        let Ok(label) = std::fs::read_to_string(chip.join("label")) else {
            continue;
        };
        if !SOC_CHIP_LABELS
            .iter()
            .any(|prefix| label.trim().starts_with(prefix))
        {
            continue;
        }
        match std::fs::read_to_string(chip.join("base")) {
            Ok(base) => match base.trim().parse() {
                Ok(base) => return base,
                Err(e) => log::warn!("bad gpiochip base in {}: {}", chip.display(), e),
            },
            Err(e) => log::warn!("failed to read {}: {}", chip.join("base").display(), e),
        }
    }
    0
}

/// No flash fitted.
#[derive(Debug, Default)]
pub struct NoFlash;

impl FlashActuator for NoFlash {
    fn name(&self) -> String {
        "none".to_string()
    }

    fn energize(&mut self) -> Result<()> {
        Ok(())
    }

    fn de_energize(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashEvent {
    Energized,
    DeEnergized,
}

/// In-memory flash that records every transition.
#[derive(Clone, Debug, Default)]
pub struct RecordingFlash {
    events: Arc<Mutex<Vec<FlashEvent>>>,
}

impl RecordingFlash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlashEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// True when the last transition left the flash on.
    pub fn is_energized(&self) -> bool {
        self.events().last() == Some(&FlashEvent::Energized)
    }

    fn push(&self, event: FlashEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("flash event log poisoned"))?
            .push(event);
        Ok(())
    }
}

impl FlashActuator for RecordingFlash {
    fn name(&self) -> String {
        "recording".to_string()
    }

    fn energize(&mut self) -> Result<()> {
        self.push(FlashEvent::Energized)
    }

    fn de_energize(&mut self) -> Result<()> {
        self.push(FlashEvent::DeEnergized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_value(root: &Path, pin: u32) -> String {
        std::fs::read_to_string(root.join(format!("gpio{}/value", pin))).unwrap_or_default()
    }

    #[test]
    fn active_low_line_starts_high_and_drives_low_when_energized() -> Result<()> {
        let dir = tempdir()?;
        std::fs::create_dir(dir.path().join("gpio5"))?;

        let mut flash = SysfsGpioFlash::open_at(dir.path(), 5, true)?;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("gpio5/direction"))?,
            "high"
        );

        flash.energize()?;
        assert_eq!(read_value(dir.path(), 5), "0");
        flash.de_energize()?;
        assert_eq!(read_value(dir.path(), 5), "1");
        Ok(())
    }

    #[test]
    fn active_high_line_levels() -> Result<()> {
        let dir = tempdir()?;
        std::fs::create_dir(dir.path().join("gpio17"))?;

        let mut flash = SysfsGpioFlash::open_at(dir.path(), 17, false)?;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("gpio17/direction"))?,
            "low"
        );
        flash.energize()?;
        assert_eq!(read_value(dir.path(), 17), "1");
        Ok(())
    }

    #[test]
    fn bcm_pin_is_offset_by_the_soc_chip_base() -> Result<()> {
        let dir = tempdir()?;
        let other = dir.path().join("gpiochip0");
        std::fs::create_dir(&other)?;
        std::fs::write(other.join("label"), "gpio-expander\n")?;
        std::fs::write(other.join("base"), "0\n")?;
        let soc = dir.path().join("gpiochip512");
        std::fs::create_dir(&soc)?;
        std::fs::write(soc.join("label"), "pinctrl-bcm2711\n")?;
        std::fs::write(soc.join("base"), "512\n")?;
        std::fs::create_dir(dir.path().join("gpio517"))?;

        let mut flash = SysfsGpioFlash::open_at(dir.path(), 5, true)?;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("gpio517/direction"))?,
            "high"
        );
        assert!(!dir.path().join("gpio5").exists());
        flash.energize()?;
        assert_eq!(read_value(dir.path(), 517), "0");
        Ok(())
    }

    #[test]
    fn export_writes_the_offset_line_number() -> Result<()> {
        let dir = tempdir()?;
        let soc = dir.path().join("gpiochip512");
        std::fs::create_dir(&soc)?;
        std::fs::write(soc.join("label"), "pinctrl-bcm2835\n")?;
        std::fs::write(soc.join("base"), "512\n")?;

        // No gpio line directory appears, so open fails after exporting.
        assert!(SysfsGpioFlash::open_at(dir.path(), 5, true).is_err());
        assert_eq!(std::fs::read_to_string(dir.path().join("export"))?, "517");
        Ok(())
    }

    #[test]
    fn missing_gpio_line_fails_at_open() {
        let dir = tempdir().expect("tempdir");
        // export succeeds (plain file) but the line directory never appears.
        assert!(SysfsGpioFlash::open_at(dir.path(), 5, true).is_err());
    }

    #[test]
    fn guard_de_energizes_on_drop() -> Result<()> {
        let mut flash = RecordingFlash::new();
        let observer = flash.clone();
        {
            let _guard = FlashGuard::energize(&mut flash)?;
            assert!(observer.is_energized());
        }
        assert_eq!(
            observer.events(),
            vec![FlashEvent::Energized, FlashEvent::DeEnergized]
        );
        Ok(())
    }

    #[test]
    fn guard_de_energizes_on_early_return() {
        fn fails_while_lit(flash: &mut dyn FlashActuator) -> Result<()> {
            let _guard = FlashGuard::energize(flash)?;
            Err(anyhow!("camera exploded"))
        }

        let mut flash = RecordingFlash::new();
        let observer = flash.clone();
        assert!(fails_while_lit(&mut flash).is_err());
        assert!(!observer.is_energized());
    }
}
