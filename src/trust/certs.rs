//! Client certificate issuance and lifecycle.
//!
//! Certificates identify agents: the Common Name carries the agent-facing
//! `server_id`, and the extended key usage is client authentication only.
//! Lifecycle: issued `active`, then either `revoked` (irreversible, with a
//! revocation record) or `expired` (renewal, or the maintenance sweep
//! noticing `valid_until` has passed).

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tracing::info;

use super::ca::{to_offset, CaManager};
use super::{TrustError, STATUS_ACTIVE, STATUS_EXPIRED, STATUS_REVOKED};
use crate::crypto;

const CLIENT_KEY_BITS: usize = 2048;
const ORGANIZATION: &str = "Armada";
const ORGANIZATIONAL_UNIT: &str = "Agent";

/// A client certificate row.
#[derive(Debug, Clone)]
pub struct ServerCertificate {
    pub id: i32,
    pub server_id: String,
    pub ca_id: i32,
    pub certificate_pem: String,
    pub private_key_encrypted: String,
    pub serial_number: String,
    pub subject_dn: String,
    pub fingerprint_sha256: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: String,
    pub key_algorithm: String,
    pub key_size: i32,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ServerCertificate {
    /// Days until expiry, floored at zero.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.valid_until - now).num_days().max(0)
    }
}

/// Issues and manages client certificates under the active CA.
#[derive(Clone)]
pub struct CertIssuer {
    pool: PgPool,
    master_key: String,
    ca_manager: CaManager,
}

impl CertIssuer {
    pub fn new(pool: PgPool, master_key: String) -> Self {
        let ca_manager = CaManager::new(pool.clone(), master_key.clone());
        Self {
            pool,
            master_key,
            ca_manager,
        }
    }

    pub fn ca_manager(&self) -> &CaManager {
        &self.ca_manager
    }

    /// Issue a new client certificate for a host, signed by the active CA.
    ///
    /// Fails with [`TrustError::NoActiveCa`] when no CA is active. The
    /// returned certificate is not yet persisted; call [`CertIssuer::save`].
    pub async fn generate_client_certificate(
        &self,
        server_id: &str,
        validity_days: i64,
    ) -> Result<ServerCertificate, TrustError> {
        let ca = self.ca_manager.get_active_ca().await?;
        let ca_key = self.ca_manager.load_signing_key(&ca)?;

        let server_id = server_id.to_string();
        let ca_pem = ca.certificate_pem.clone();
        let master_key = self.master_key.clone();
        let ca_id = ca.id;

        let cert = tokio::task::spawn_blocking(move || {
            build_client_certificate(&server_id, validity_days, &ca_pem, ca_key, ca_id, &master_key)
        })
        .await
        .map_err(|e| TrustError::Generation(e.to_string()))??;

        Ok(cert)
    }

    /// Persist a freshly issued certificate.
    pub async fn save(&self, cert: &mut ServerCertificate) -> Result<(), TrustError> {
        let row = sqlx::query(
            r#"
            INSERT INTO server_certificates (
                server_id, ca_id, certificate_pem, private_key_encrypted,
                serial_number, subject_dn, fingerprint_sha256,
                valid_from, valid_until, status, key_algorithm, key_size
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id, created_at
            "#,
        )
        .bind(&cert.server_id)
        .bind(cert.ca_id)
        .bind(&cert.certificate_pem)
        .bind(&cert.private_key_encrypted)
        .bind(&cert.serial_number)
        .bind(&cert.subject_dn)
        .bind(&cert.fingerprint_sha256)
        .bind(cert.valid_from)
        .bind(cert.valid_until)
        .bind(&cert.status)
        .bind(&cert.key_algorithm)
        .bind(cert.key_size)
        .fetch_one(&self.pool)
        .await?;

        cert.id = row.get("id");
        cert.created_at = row.get("created_at");
        info!(
            server_id = %cert.server_id,
            serial = %cert.serial_number,
            "issued client certificate"
        );
        Ok(())
    }

    /// The active certificate for a host, if any.
    pub async fn get_active(&self, server_id: &str) -> Result<ServerCertificate, TrustError> {
        let row = sqlx::query(&select_cert_sql(
            "WHERE server_id = $1 AND status = 'active' ORDER BY created_at DESC LIMIT 1",
        ))
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(TrustError::CertificateNotFound)?;
        Ok(cert_from_row(&row))
    }

    /// Look up by serial number (the edge auth path).
    pub async fn get_by_serial(&self, serial: &str) -> Result<ServerCertificate, TrustError> {
        let row = sqlx::query(&select_cert_sql("WHERE serial_number = $1"))
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TrustError::CertificateNotFound)?;
        Ok(cert_from_row(&row))
    }

    /// Certificate history for a host, newest first.
    pub async fn list(&self, server_id: &str) -> Result<Vec<ServerCertificate>, TrustError> {
        let rows = sqlx::query(&select_cert_sql(
            "WHERE server_id = $1 ORDER BY created_at DESC",
        ))
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(cert_from_row).collect())
    }

    /// Revoke a certificate and write the revocation record, transactionally.
    ///
    /// Revocation is irreversible; revoking anything that is not currently
    /// `active` fails with [`TrustError::AlreadyRevoked`].
    pub async fn revoke(
        &self,
        certificate_id: i32,
        reason: &str,
        revoked_by: Option<&str>,
    ) -> Result<(), TrustError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM server_certificates WHERE id = $1 FOR UPDATE")
                .bind(certificate_id)
                .fetch_optional(&mut *tx)
                .await?;
        match current.as_deref() {
            None => return Err(TrustError::CertificateNotFound),
            Some(STATUS_ACTIVE) => {}
            Some(_) => return Err(TrustError::AlreadyRevoked),
        }

        sqlx::query(
            r#"
            UPDATE server_certificates
            SET status = 'revoked', revoked_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(certificate_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO certificate_revocations (server_certificate_id, revoked_at, reason, revoked_by)
            VALUES ($1, NOW(), $2, $3)
            "#,
        )
        .bind(certificate_id)
        .bind(reason)
        .bind(revoked_by)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(certificate_id, reason, "revoked client certificate");
        Ok(())
    }

    /// Renew: mark any active certificate for the host `expired` (not
    /// revoked), then issue and persist a fresh one.
    pub async fn renew(
        &self,
        server_id: &str,
        validity_days: i64,
    ) -> Result<ServerCertificate, TrustError> {
        sqlx::query(
            r#"
            UPDATE server_certificates
            SET status = 'expired', updated_at = NOW()
            WHERE server_id = $1 AND status = 'active'
            "#,
        )
        .bind(server_id)
        .execute(&self.pool)
        .await?;

        let mut cert = self
            .generate_client_certificate(server_id, validity_days)
            .await?;
        self.save(&mut cert).await?;
        Ok(cert)
    }

    /// Validate a certificate by serial: distinct errors for not found,
    /// revoked, not yet valid, and expired.
    pub async fn validate(&self, serial: &str) -> Result<(), TrustError> {
        let cert = self.get_by_serial(serial).await?;
        validate_window(&cert, Utc::now())
    }

    /// Flip any `active` certificate past its validity window to `expired`.
    /// Returns the number of certificates swept.
    pub async fn mark_expired_certificates(&self) -> Result<u64, TrustError> {
        mark_expired_certificates(&self.pool).await
    }

    /// Active certificates expiring within `days`, soonest first.
    pub async fn get_expiring(&self, days: i64) -> Result<Vec<ServerCertificate>, TrustError> {
        let threshold = Utc::now() + Duration::days(days);
        let rows = sqlx::query(&select_cert_sql(
            "WHERE status = 'active' AND valid_until <= $1 AND valid_until > NOW() \
             ORDER BY valid_until ASC",
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(cert_from_row).collect())
    }

    /// Decrypt a certificate's private key for distribution.
    pub fn decrypt_private_key(&self, cert: &ServerCertificate) -> Result<String, TrustError> {
        crypto::decrypt(&cert.private_key_encrypted, &self.master_key).map_err(Into::into)
    }
}

/// Maintenance sweep: expire every `active` certificate whose validity
/// window has passed. Pool-only so the retention cleaner can run it
/// without the master key.
pub async fn mark_expired_certificates(pool: &PgPool) -> Result<u64, TrustError> {
    let result = sqlx::query(
        r#"
        UPDATE server_certificates
        SET status = 'expired', updated_at = NOW()
        WHERE status = 'active' AND valid_until < NOW()
        "#,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Pure validity check against the persisted status and window.
fn validate_window(cert: &ServerCertificate, now: DateTime<Utc>) -> Result<(), TrustError> {
    if cert.status == STATUS_REVOKED {
        return Err(TrustError::Revoked);
    }
    if now < cert.valid_from {
        return Err(TrustError::NotYetValid);
    }
    if cert.status == STATUS_EXPIRED || now > cert.valid_until {
        return Err(TrustError::Expired);
    }
    Ok(())
}

fn select_cert_sql(suffix: &str) -> String {
    format!(
        "SELECT id, server_id, ca_id, certificate_pem, private_key_encrypted, \
         serial_number, subject_dn, fingerprint_sha256, valid_from, valid_until, \
         status, key_algorithm, key_size, created_at, revoked_at \
         FROM server_certificates {suffix}"
    )
}

fn cert_from_row(row: &sqlx::postgres::PgRow) -> ServerCertificate {
    ServerCertificate {
        id: row.get("id"),
        server_id: row.get("server_id"),
        ca_id: row.get("ca_id"),
        certificate_pem: row.get("certificate_pem"),
        private_key_encrypted: row.get("private_key_encrypted"),
        serial_number: row.get("serial_number"),
        subject_dn: row.get("subject_dn"),
        fingerprint_sha256: row.get("fingerprint_sha256"),
        valid_from: row.get("valid_from"),
        valid_until: row.get("valid_until"),
        status: row.get("status"),
        key_algorithm: row.get("key_algorithm"),
        key_size: row.get("key_size"),
        created_at: row.get("created_at"),
        revoked_at: row.get("revoked_at"),
    }
}

/// Build one end-entity certificate signed by the CA.
fn build_client_certificate(
    server_id: &str,
    validity_days: i64,
    ca_pem: &str,
    ca_key: KeyPair,
    ca_id: i32,
    master_key: &str,
) -> Result<ServerCertificate, TrustError> {
    let issuer = Issuer::from_ca_cert_pem(ca_pem, ca_key)?;

    let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, CLIENT_KEY_BITS)
        .map_err(|e| TrustError::Generation(e.to_string()))?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| TrustError::Generation(e.to_string()))?;
    let key_pair = KeyPair::from_pem(&key_pem)?;

    let serial_number = crypto::generate_serial_number();
    let serial_bytes = hex::decode(&serial_number).expect("serial is hex");

    let valid_from = Utc::now();
    let valid_until = valid_from + Duration::days(validity_days);

    let mut params = CertificateParams::default();
    // server_id in the CN is what the edge binds requests to.
    params
        .distinguished_name
        .push(DnType::CommonName, server_id.to_string());
    params
        .distinguished_name
        .push(DnType::OrganizationName, ORGANIZATION);
    params
        .distinguished_name
        .push(DnType::OrganizationalUnitName, ORGANIZATIONAL_UNIT);
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    params.serial_number = Some(SerialNumber::from_slice(&serial_bytes));
    params.not_before = to_offset(valid_from);
    params.not_after = to_offset(valid_until);

    let certificate = params.signed_by(&key_pair, &issuer)?;
    let fingerprint = hex::encode(Sha256::digest(certificate.der()));
    let encrypted_key = crypto::encrypt(&key_pem, master_key)?;

    Ok(ServerCertificate {
        id: 0,
        server_id: server_id.to_string(),
        ca_id,
        certificate_pem: certificate.pem(),
        private_key_encrypted: encrypted_key,
        serial_number,
        subject_dn: format!("CN={server_id}, O={ORGANIZATION}, OU={ORGANIZATIONAL_UNIT}"),
        fingerprint_sha256: fingerprint,
        valid_from,
        valid_until,
        status: STATUS_ACTIVE.to_string(),
        key_algorithm: "RSA".to_string(),
        key_size: CLIENT_KEY_BITS as i32,
        created_at: Utc::now(),
        revoked_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, IsCa};

    fn test_ca() -> (String, KeyPair) {
        // ECDSA keys keep the test fast; the issuance path is identical.
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "test ca".to_string());
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages.push(KeyUsagePurpose::KeyCertSign);

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key)
    }

    #[test]
    fn client_certificate_has_expected_shape() {
        let (ca_pem, ca_key) = test_ca();
        let cert = build_client_certificate(
            "00000000-0000-0000-0000-000000000001",
            365,
            &ca_pem,
            ca_key,
            7,
            "issuer-master-key",
        )
        .unwrap();

        assert!(cert.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(cert.ca_id, 7);
        assert_eq!(cert.status, STATUS_ACTIVE);
        assert_eq!(cert.serial_number.len(), 32);
        assert_eq!(cert.fingerprint_sha256.len(), 64);
        assert_eq!(cert.key_size, 2048);
        assert!(cert
            .subject_dn
            .starts_with("CN=00000000-0000-0000-0000-000000000001"));

        // Key decrypts and differs from the CA key material.
        let key_pem = crypto::decrypt(&cert.private_key_encrypted, "issuer-master-key").unwrap();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn distinct_hosts_get_distinct_material() {
        let (ca_pem, ca_key) = test_ca();
        let a = build_client_certificate("host-a", 30, &ca_pem, ca_key, 1, "mk").unwrap();

        let (ca_pem_b, ca_key_b) = test_ca();
        let b = build_client_certificate("host-b", 30, &ca_pem_b, ca_key_b, 1, "mk").unwrap();

        assert_ne!(a.serial_number, b.serial_number);
        assert_ne!(a.fingerprint_sha256, b.fingerprint_sha256);
    }

    fn cert_with(status: &str, from_days: i64, until_days: i64) -> ServerCertificate {
        let now = Utc::now();
        ServerCertificate {
            id: 1,
            server_id: "h".to_string(),
            ca_id: 1,
            certificate_pem: String::new(),
            private_key_encrypted: String::new(),
            serial_number: "ab".repeat(16),
            subject_dn: String::new(),
            fingerprint_sha256: String::new(),
            valid_from: now + Duration::days(from_days),
            valid_until: now + Duration::days(until_days),
            status: status.to_string(),
            key_algorithm: "RSA".to_string(),
            key_size: 2048,
            created_at: now,
            revoked_at: None,
        }
    }

    #[test]
    fn validation_returns_distinct_kinds() {
        let now = Utc::now();

        assert!(validate_window(&cert_with(STATUS_ACTIVE, -1, 30), now).is_ok());
        assert!(matches!(
            validate_window(&cert_with(STATUS_REVOKED, -1, 30), now),
            Err(TrustError::Revoked)
        ));
        assert!(matches!(
            validate_window(&cert_with(STATUS_ACTIVE, 1, 30), now),
            Err(TrustError::NotYetValid)
        ));
        assert!(matches!(
            validate_window(&cert_with(STATUS_ACTIVE, -30, -1), now),
            Err(TrustError::Expired)
        ));
        assert!(matches!(
            validate_window(&cert_with(STATUS_EXPIRED, -1, 30), now),
            Err(TrustError::Expired)
        ));
    }

    #[test]
    fn days_remaining_floors_at_zero() {
        let now = Utc::now();
        assert_eq!(cert_with(STATUS_ACTIVE, -1, 10).days_remaining(now), 10);
        assert_eq!(cert_with(STATUS_EXPIRED, -30, -2).days_remaining(now), 0);
    }
}
