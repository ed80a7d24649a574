//! Trust-on-first-use host key pinning.
//!
//! The first host key a managed host ever presents is pinned on its row;
//! every later session must present the same key. A mismatch aborts the
//! dial with a dedicated error, since it means either a MITM or a host
//! rebuild that an operator must acknowledge by clearing the pin.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use russh::client;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::ShellError;
use crate::storage::servers;

/// OpenSSH-style fingerprint: `SHA256:` + base64(SHA-256(wire-format key)).
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    format!("SHA256:{}", BASE64.encode(digest))
}

/// SSH client handler enforcing TOFU pinning against the host's row.
pub struct TofuVerifier {
    pool: PgPool,
    server_id: Uuid,
    /// Fingerprint presented during the handshake, for the session audit.
    pub observed: Arc<Mutex<Option<String>>>,
}

impl TofuVerifier {
    pub fn new(pool: PgPool, server_id: Uuid) -> Self {
        Self {
            pool,
            server_id,
            observed: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl client::Handler for TofuVerifier {
    type Error = ShellError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, ShellError> {
        let presented = fingerprint(server_public_key);
        *self.observed.lock().expect("fingerprint lock") = Some(presented.clone());

        let stored = servers::host_key_fingerprint(&self.pool, self.server_id).await?;

        match stored.filter(|s| !s.is_empty()) {
            None => {
                info!(server_id = %self.server_id, fingerprint = %presented, "first connection, pinning host key");
                servers::store_host_key_fingerprint(&self.pool, self.server_id, &presented)
                    .await?;
                Ok(true)
            }
            Some(pinned) if pinned == presented => Ok(true),
            Some(pinned) => {
                warn!(
                    server_id = %self.server_id,
                    expected = %pinned,
                    received = %presented,
                    "host key mismatch"
                );
                Err(ShellError::HostKeyMismatch {
                    expected: pinned,
                    presented,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::key::KeyPair;

    #[test]
    fn fingerprint_is_prefixed_base64_sha256() {
        let key = KeyPair::generate_ed25519().unwrap();
        let fp = fingerprint(&key.clone_public_key().unwrap());

        assert!(fp.starts_with("SHA256:"));
        // 32 bytes of digest → 44 base64 chars (with padding).
        assert_eq!(fp.len(), "SHA256:".len() + 44);
    }

    #[test]
    fn fingerprint_is_stable_per_key_and_distinct_across_keys() {
        let a = KeyPair::generate_ed25519().unwrap();
        let b = KeyPair::generate_ed25519().unwrap();

        let fp_a1 = fingerprint(&a.clone_public_key().unwrap());
        let fp_a2 = fingerprint(&a.clone_public_key().unwrap());
        let fp_b = fingerprint(&b.clone_public_key().unwrap());

        assert_eq!(fp_a1, fp_a2);
        assert_ne!(fp_a1, fp_b);
    }
}
