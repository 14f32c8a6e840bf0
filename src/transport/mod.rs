//! Network egress towards the collector.
//!
//! - `upload`: the best-effort photo delivery client
//! - `multipart`: `multipart/form-data` body construction
//! - `tls`: rustls client configuration and certificate materials

pub mod multipart;
pub mod tls;
pub mod upload;

pub use multipart::MultipartForm;
pub use tls::{TlsConfig, TlsMaterials, TlsVerification};
pub use upload::{UploadClient, UploadError, UploadOutcome, UploadSettings};
