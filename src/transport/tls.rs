//! TLS client configuration for uploads.
//!
//! Certificate verification is on by default:
//! - CA verification: webpki roots, or a custom PEM CA for a self-signed collector
//! - Client certificates: mutual TLS when the collector requires it
//! - Insecure mode: explicit opt-in only, logged every time a client is built

use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;

/// Whether the collector's certificate chain is checked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsVerification {
    #[default]
    Verify,
    /// Accept any server certificate. Lab use only.
    Insecure,
}

impl std::fmt::Display for TlsVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verify => write!(f, "verify"),
            Self::Insecure => write!(f, "insecure"),
        }
    }
}

/// PEM materials for upload TLS.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// PEM-encoded CA certificates. When None, the webpki roots are used.
    pub ca: Option<Vec<u8>>,

    /// Client certificate chain and key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Load TLS materials from file paths. Client cert and key go together.
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read upload TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read upload client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read upload client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("upload client certificate provided without key")),
            (None, Some(_)) => return Err(anyhow!("upload client key provided without certificate")),
        };

        Ok(Self { ca, client_auth })
    }
}

#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    pub verification: TlsVerification,
    pub materials: TlsMaterials,
}

impl TlsConfig {
    /// Build the rustls client configuration used by the upload agent.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!("failed to configure TLS versions: {}", e))?;

        let builder = match self.verification {
            TlsVerification::Verify => builder.with_root_certificates(self.root_store()?),
            TlsVerification::Insecure => {
                log::warn!(
                    "upload TLS certificate verification DISABLED; any server certificate is accepted"
                );
                if self.materials.ca.is_some() {
                    log::warn!("upload TLS CA is ignored in insecure mode");
                }
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            }
        };

        let config = match &self.materials.client_auth {
            Some((cert_bytes, key_bytes)) => {
                let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| anyhow!("failed to parse client certificate from PEM: {}", e))?;
                let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
                    .map_err(|e| anyhow!("failed to parse private key from PEM: {}", e))?
                    .ok_or_else(|| anyhow!("no private key found in PEM file"))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| anyhow!("failed to configure TLS client auth: {}", e))?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        match &self.materials.ca {
            Some(ca_bytes) => {
                let certs = rustls_pemfile::certs(&mut ca_bytes.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| anyhow!("failed to parse CA certificate from PEM: {}", e))?;
                if certs.is_empty() {
                    return Err(anyhow!("upload TLS CA file contains no certificates"));
                }
                for cert in certs {
                    roots
                        .add(cert)
                        .map_err(|e| anyhow!("failed to add CA certificate: {}", e))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        Ok(roots)
    }
}

/// Skips chain and name checks but still verifies handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
