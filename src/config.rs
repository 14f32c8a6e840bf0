use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{BackendKind, CameraModuleParams, CaptureSettings, UsbWebcamParams};
use crate::clock::{DEFAULT_RTC_COMMAND, DEFAULT_RTC_TIMEOUT};
use crate::pipeline::LoopSettings;
use crate::process::CommandSpec;
use crate::transport::upload::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_BACKOFF,
};
use crate::transport::{TlsConfig, TlsMaterials, TlsVerification, UploadSettings};

pub const CONFIG_ENV: &str = "PHOTO_LOGGER_CONFIG";

const DEFAULT_FLASH_GPIO: u32 = 5;
const DEFAULT_INTERVAL_SECS: u64 = 30;
const DEFAULT_SERVER_URL: &str = "https://127.0.0.1:5000/upload";
const DEFAULT_CAPTURE_DIR: &str = "/home/pi/captured";
const DEFAULT_STABILIZATION_MS: u64 = 700;
const MAX_STABILIZATION: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Default)]
struct LoggerConfigFile {
    interval_secs: Option<u64>,
    max_cycles: Option<u64>,
    retain_captures: Option<bool>,
    flash: Option<FlashConfigFile>,
    capture: Option<CaptureConfigFile>,
    upload: Option<UploadConfigFile>,
    clock: Option<ClockConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FlashConfigFile {
    /// `null` disables the flash.
    #[serde(default = "default_flash_gpio")]
    gpio: Option<u32>,
    active_low: Option<bool>,
}

fn default_flash_gpio() -> Option<u32> {
    Some(DEFAULT_FLASH_GPIO)
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    backend: Option<String>,
    dir: Option<PathBuf>,
    stabilization_ms: Option<u64>,
    timeout_secs: Option<u64>,
    usb_webcam: Option<UsbWebcamParams>,
    camera_module: Option<CameraModuleParams>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    url: Option<String>,
    tls_insecure: Option<bool>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ClockConfigFile {
    rtc_command: Option<String>,
    rtc_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub interval: Duration,
    pub max_cycles: Option<u64>,
    pub retain_captures: bool,
    pub flash: FlashConfig,
    pub capture: CaptureConfig,
    pub upload: UploadConfig,
    pub clock: ClockConfig,
}

#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// BCM pin driving the flash relay. None runs without a flash.
    /// The sysfs line number is derived from the SoC gpiochip base.
    pub gpio: Option<u32>,
    pub active_low: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub backend: BackendKind,
    pub dir: PathBuf,
    pub stabilization: Duration,
    /// None uses the backend's own bound.
    pub timeout: Option<Duration>,
    pub usb_webcam: UsbWebcamParams,
    pub camera_module: CameraModuleParams,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub url: String,
    pub tls_insecure: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct ClockConfig {
    pub rtc_command: String,
    pub rtc_timeout: Duration,
}

impl LoggerConfig {
    /// Load from the file named by `PHOTO_LOGGER_CONFIG` (if set), then the
    /// environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LoggerConfigFile) -> Result<Self> {
        let flash = match file.flash {
            Some(flash) => FlashConfig {
                gpio: flash.gpio,
                active_low: flash.active_low.unwrap_or(true),
            },
            None => FlashConfig {
                gpio: Some(DEFAULT_FLASH_GPIO),
                active_low: true,
            },
        };

        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureConfig {
            backend: match capture_file.backend.as_deref() {
                Some(name) => name.parse()?,
                None => BackendKind::default(),
            },
            dir: capture_file
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CAPTURE_DIR)),
            stabilization: Duration::from_millis(
                capture_file
                    .stabilization_ms
                    .unwrap_or(DEFAULT_STABILIZATION_MS),
            ),
            timeout: capture_file.timeout_secs.map(Duration::from_secs),
            usb_webcam: capture_file.usb_webcam.unwrap_or_default(),
            camera_module: capture_file.camera_module.unwrap_or_default(),
        };

        let upload_file = file.upload.unwrap_or_default();
        let upload = UploadConfig {
            url: upload_file
                .url
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            tls_insecure: upload_file.tls_insecure.unwrap_or(false),
            ca_path: upload_file.ca_path,
            client_cert_path: upload_file.client_cert_path,
            client_key_path: upload_file.client_key_path,
            connect_timeout: upload_file
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            request_timeout: upload_file
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_retries: upload_file.max_retries.unwrap_or(0),
            retry_backoff: upload_file
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_BACKOFF),
        };

        let clock_file = file.clock.unwrap_or_default();
        let clock = ClockConfig {
            rtc_command: clock_file
                .rtc_command
                .unwrap_or_else(|| DEFAULT_RTC_COMMAND.to_string()),
            rtc_timeout: clock_file
                .rtc_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RTC_TIMEOUT),
        };

        Ok(Self {
            interval: Duration::from_secs(file.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS)),
            max_cycles: file.max_cycles,
            retain_captures: file.retain_captures.unwrap_or(true),
            flash,
            capture,
            upload,
            clock,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(gpio) = env_value("FLASH_GPIO") {
            self.flash.gpio = match gpio.to_lowercase().as_str() {
                "none" | "off" | "-1" => None,
                _ => Some(
                    gpio.parse()
                        .map_err(|_| anyhow!("FLASH_GPIO must be a pin number or 'none'"))?,
                ),
            };
        }
        if let Some(active_low) = env_bool("FLASH_ACTIVE_LOW")? {
            self.flash.active_low = active_low;
        }
        if let Some(secs) = env_u64("PHOTO_INTERVAL")? {
            self.interval = Duration::from_secs(secs);
        }
        if let Some(url) = env_value("SERVER_URL") {
            self.upload.url = url;
        }
        if let Some(backend) = env_value("CAPTURE_BACKEND") {
            self.capture.backend = backend.parse()?;
        }
        if let Some(dir) = env_value("CAPTURE_DIR") {
            self.capture.dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_u64("STABILIZATION_MS")? {
            self.capture.stabilization = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("CAPTURE_TIMEOUT_SECS")? {
            self.capture.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(insecure) = env_bool("TLS_INSECURE")? {
            self.upload.tls_insecure = insecure;
        }
        if let Some(path) = env_value("TLS_CA_PATH") {
            self.upload.ca_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("TLS_CLIENT_CERT_PATH") {
            self.upload.client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("TLS_CLIENT_KEY_PATH") {
            self.upload.client_key_path = Some(PathBuf::from(path));
        }
        if let Some(retries) = env_u64("UPLOAD_MAX_RETRIES")? {
            self.upload.max_retries = u32::try_from(retries)
                .map_err(|_| anyhow!("UPLOAD_MAX_RETRIES is out of range"))?;
        }
        if let Some(retain) = env_bool("RETAIN_CAPTURES")? {
            self.retain_captures = retain;
        }
        if let Some(command) = env_value("RTC_COMMAND") {
            self.clock.rtc_command = command;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("photo interval must be greater than zero"));
        }
        if self.max_cycles == Some(0) {
            return Err(anyhow!("max_cycles must be greater than zero when set"));
        }
        if self.capture.stabilization > MAX_STABILIZATION {
            return Err(anyhow!(
                "stabilization must be at most {}ms (got {}ms)",
                MAX_STABILIZATION.as_millis(),
                self.capture.stabilization.as_millis()
            ));
        }
        if self.capture.timeout.map_or(false, |timeout| timeout.is_zero()) {
            return Err(anyhow!("capture timeout must be greater than zero"));
        }
        self.capture.usb_webcam.validate()?;
        self.capture.camera_module.validate()?;

        let url = url::Url::parse(&self.upload.url)
            .map_err(|e| anyhow!("invalid SERVER_URL '{}': {}", self.upload.url, e))?;
        match url.scheme() {
            "https" => {}
            "http" => log::warn!(
                "upload endpoint {} is plain http; photos are sent unencrypted",
                self.upload.url
            ),
            other => {
                return Err(anyhow!(
                    "SERVER_URL scheme must be http or https (got '{}')",
                    other
                ))
            }
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(anyhow!("SERVER_URL '{}' has no host", self.upload.url));
        }
        if self.upload.connect_timeout.is_zero() || self.upload.request_timeout.is_zero() {
            return Err(anyhow!("upload timeouts must be greater than zero"));
        }

        if CommandSpec::from_command_line(&self.clock.rtc_command).is_none() {
            return Err(anyhow!("RTC_COMMAND must not be empty"));
        }
        if self.clock.rtc_timeout.is_zero() {
            return Err(anyhow!("RTC read timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            dir: self.capture.dir.clone(),
            stabilization: self.capture.stabilization,
            timeout: self
                .capture
                .timeout
                .unwrap_or_else(|| self.capture.backend.default_timeout()),
        }
    }

    /// Reads any configured TLS material from disk.
    pub fn upload_settings(&self) -> Result<UploadSettings> {
        let materials = TlsMaterials::load(
            self.upload.ca_path.as_deref(),
            self.upload.client_cert_path.as_deref(),
            self.upload.client_key_path.as_deref(),
        )
        .context("failed to load upload TLS material")?;
        let verification = if self.upload.tls_insecure {
            TlsVerification::Insecure
        } else {
            TlsVerification::Verify
        };
        Ok(UploadSettings {
            url: self.upload.url.clone(),
            tls: TlsConfig {
                verification,
                materials,
            },
            connect_timeout: self.upload.connect_timeout,
            request_timeout: self.upload.request_timeout,
            max_retries: self.upload.max_retries,
            retry_backoff: self.upload.retry_backoff,
        })
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            interval: self.interval,
            max_cycles: self.max_cycles,
            retain_captures: self.retain_captures,
        }
    }

    pub fn rtc_command(&self) -> Result<CommandSpec> {
        CommandSpec::from_command_line(&self.clock.rtc_command)
            .ok_or_else(|| anyhow!("RTC_COMMAND must not be empty"))
    }
}

fn read_config_file(path: &Path) -> Result<LoggerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env_value(name) {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(anyhow!("{} must be a boolean (true/false)", name)),
        },
        None => Ok(None),
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match env_value(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", name)),
        None => Ok(None),
    }
}
