//! Delivery of captured photos to the collector.
//!
//! One `POST` per capture with a multipart body holding `image` and
//! `timestamp`. Any 2xx is success; everything else is a delivery failure
//! that is reported to the caller, never raised.

use anyhow::Result;
use std::time::Duration;

use super::multipart::MultipartForm;
use super::tls::TlsConfig;
use crate::capture::ImageArtifact;
use crate::clock::ClockReading;
use crate::shutdown::Shutdown;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

const BODY_EXCERPT_CHARS: usize = 256;

#[derive(Clone, Debug)]
pub struct UploadSettings {
    pub url: String,
    pub tls: TlsConfig,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Extra attempts after the first. 0 keeps single best-effort delivery.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff: Duration,
}

impl UploadSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tls: TlsConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: 0,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadError {
    /// The artifact could not be read back from disk.
    ArtifactUnreadable { message: String },
    /// DNS, connect, TLS or I/O failure.
    TransportFailure { message: String, attempts: u32 },
    /// The collector answered with a non-2xx status.
    Rejected {
        status: u16,
        body: String,
        attempts: u32,
    },
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArtifactUnreadable { message } => write!(f, "artifact unreadable: {}", message),
            Self::TransportFailure { message, attempts } => {
                write!(f, "transport failure after {} attempt(s): {}", attempts, message)
            }
            Self::Rejected {
                status,
                body,
                attempts,
            } => write!(
                f,
                "collector rejected upload with status {} after {} attempt(s): {}",
                status, attempts, body
            ),
        }
    }
}

impl std::error::Error for UploadError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Delivered { status: u16, attempts: u32 },
    Failed(UploadError),
}

impl UploadOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

pub struct UploadClient {
    agent: ureq::Agent,
    settings: UploadSettings,
    shutdown: Shutdown,
}

impl UploadClient {
    pub fn new(settings: UploadSettings, shutdown: Shutdown) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .tls_config(settings.tls.client_config()?)
            .build();
        Ok(Self {
            agent,
            settings,
            shutdown,
        })
    }

    pub fn url(&self) -> &str {
        &self.settings.url
    }

    /// Send one artifact. Never panics or propagates; failures come back as
    /// [`UploadOutcome::Failed`].
    pub fn deliver(&self, artifact: &ImageArtifact, timestamp: &ClockReading) -> UploadOutcome {
        let bytes = match std::fs::read(artifact.path()) {
            Ok(bytes) => bytes,
            Err(e) => {
                return UploadOutcome::Failed(UploadError::ArtifactUnreadable {
                    message: format!("{}: {}", artifact.path().display(), e),
                })
            }
        };
        let (content_type, body) = MultipartForm::new()
            .file("image", &artifact.file_name(), "image/jpeg", &bytes)
            .text("timestamp", &timestamp.to_iso8601())
            .finish();

        let max_attempts = self.settings.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            let outcome = self.post(&content_type, &body, attempt);
            let retryable = match &outcome {
                UploadOutcome::Delivered { .. } => false,
                UploadOutcome::Failed(UploadError::TransportFailure { .. }) => true,
                UploadOutcome::Failed(UploadError::Rejected { status, .. }) => *status >= 500,
                UploadOutcome::Failed(UploadError::ArtifactUnreadable { .. }) => false,
            };
            if !retryable || attempt >= max_attempts {
                return outcome;
            }

            let backoff = self.backoff(attempt);
            if let UploadOutcome::Failed(e) = &outcome {
                log::warn!("[UPLOAD] attempt {} failed ({}); retrying in {:?}", attempt, e, backoff);
            }
            if self.shutdown.wait_timeout(backoff) {
                return outcome;
            }
            attempt += 1;
        }
    }

    fn post(&self, content_type: &str, body: &[u8], attempt: u32) -> UploadOutcome {
        match self
            .agent
            .post(&self.settings.url)
            .set("Content-Type", content_type)
            .send_bytes(body)
        {
            Ok(response) => {
                let status = response.status();
                let text = excerpt(response.into_string().unwrap_or_default());
                if (200..300).contains(&status) {
                    log::info!("[UPLOAD] Status {}: {}", status, text);
                    UploadOutcome::Delivered {
                        status,
                        attempts: attempt,
                    }
                } else {
                    UploadOutcome::Failed(UploadError::Rejected {
                        status,
                        body: text,
                        attempts: attempt,
                    })
                }
            }
            Err(ureq::Error::Status(status, response)) => {
                UploadOutcome::Failed(UploadError::Rejected {
                    status,
                    body: excerpt(response.into_string().unwrap_or_default()),
                    attempts: attempt,
                })
            }
            Err(ureq::Error::Transport(transport)) => {
                UploadOutcome::Failed(UploadError::TransportFailure {
                    message: transport.to_string(),
                    attempts: attempt,
                })
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt - 1).min(6);
        self.settings.retry_backoff.saturating_mul(factor)
    }
}

fn excerpt(text: String) -> String {
    text.trim().chars().take(BODY_EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() -> Result<()> {
        let mut settings = UploadSettings::new("http://127.0.0.1:9/upload");
        settings.retry_backoff = Duration::from_millis(100);
        let client = UploadClient::new(settings, Shutdown::new())?;
        assert_eq!(client.backoff(1), Duration::from_millis(100));
        assert_eq!(client.backoff(2), Duration::from_millis(200));
        assert_eq!(client.backoff(3), Duration::from_millis(400));
        assert_eq!(client.backoff(20), Duration::from_millis(6400));
        Ok(())
    }

    #[test]
    fn rejected_display_carries_status() {
        let err = UploadError::Rejected {
            status: 413,
            body: "too large".to_string(),
            attempts: 1,
        };
        assert!(err.to_string().contains("413"));
    }
}
