//! Trust core: certificate authority and per-host client certificates.
//!
//! The platform is its own trust anchor. A self-signed CA (exactly one
//! active at a time) signs short-lived client certificates whose Common
//! Name is the agent-facing `server_id`. The TLS-terminating edge proxy
//! verifies the handshake and forwards certificate metadata as headers; the
//! database is the source of truth for revocation and expiry.
//!
//! All private keys are envelope-encrypted before they touch the database.

mod ca;
mod certs;

pub use ca::{CaManager, CertificateAuthority};
pub use certs::{mark_expired_certificates, CertIssuer, ServerCertificate};

use crate::crypto::CryptoError;
use crate::storage::StorageError;

/// Certificate status values persisted in `server_certificates.status`.
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_REVOKED: &str = "revoked";
pub const STATUS_EXPIRED: &str = "expired";

/// Trust core failures. Validation outcomes are distinct variants so the
/// edge can answer precisely.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("no active certificate authority")]
    NoActiveCa,

    #[error("certificate authority not found")]
    CaNotFound,

    #[error("certificate not found")]
    CertificateNotFound,

    #[error("certificate is revoked")]
    Revoked,

    #[error("certificate has expired")]
    Expired,

    #[error("certificate is not yet valid")]
    NotYetValid,

    #[error("certificate not found or already revoked")]
    AlreadyRevoked,
}

impl From<sqlx::Error> for TrustError {
    fn from(e: sqlx::Error) -> Self {
        TrustError::Storage(StorageError::Database(e))
    }
}

impl From<rcgen::Error> for TrustError {
    fn from(e: rcgen::Error) -> Self {
        TrustError::Generation(e.to_string())
    }
}
