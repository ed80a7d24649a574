//! Host identity and reachability.
//!
//! Hosts are registered by operators; the core never deletes them. The
//! digest worker advances liveness, the shell proxy reads SSH reachability
//! and pins host keys, and the deployment worker resolves targets joined to
//! their primary SSH private key.

use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use super::{Result, StorageError};

/// SSH connection details for one host, joined to its primary private key.
#[derive(Debug, Clone)]
pub struct ShellTarget {
    pub ssh_host: String,
    pub ssh_port: i32,
    pub ssh_username: String,
    /// Envelope-encrypted private key; `None` when no primary key is bound.
    pub encrypted_key: Option<String>,
}

/// Deployment target row: shell reachability plus the identities the
/// inventory needs.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub id: Uuid,
    pub hostname: String,
    pub ssh_host: String,
    pub ssh_port: i32,
    pub ssh_username: String,
    pub encrypted_key: Option<String>,
    /// Agent-facing `server_id`, carried into the inventory.
    pub agent_server_id: String,
}

/// Existence check for the agent-facing `server_id`.
pub async fn server_exists(pool: &PgPool, server_id: &str) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM servers WHERE server_id = $1)",
    )
    .bind(server_id)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Advance host liveness. Runs inside the digest transaction.
///
/// A zero-row update means the host vanished after ingest accepted the
/// snapshot; that is not an error for the transaction.
pub async fn touch_last_seen(conn: &mut PgConnection, server_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE servers SET last_seen_at = NOW(), updated_at = NOW() WHERE server_id = $1",
    )
    .bind(server_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// SSH reachability + primary key for the shell proxy.
pub async fn fetch_shell_target(pool: &PgPool, id: Uuid) -> Result<ShellTarget> {
    let row = sqlx::query(
        r#"
        SELECT s.ssh_host, s.ssh_port, s.ssh_username, pk.private_key_content
        FROM servers s
        LEFT JOIN server_private_keys spk ON s.id = spk.server_id AND spk.is_primary = true
        LEFT JOIN private_keys pk ON spk.private_key_id = pk.id
        WHERE s.id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StorageError::NotFound { entity: "server" })?;

    Ok(ShellTarget {
        ssh_host: row.get::<Option<String>, _>("ssh_host").unwrap_or_default(),
        ssh_port: row.get::<Option<i32>, _>("ssh_port").unwrap_or(22),
        ssh_username: row
            .get::<Option<String>, _>("ssh_username")
            .unwrap_or_default(),
        encrypted_key: row.get("private_key_content"),
    })
}

/// Resolve deployment targets for a set of host ids.
pub async fn fetch_deploy_targets(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<DeployTarget>> {
    let rows = sqlx::query(
        r#"
        SELECT
            s.id,
            COALESCE(NULLIF(s.hostname, ''), s.name) AS hostname,
            s.ssh_host,
            s.ssh_port,
            s.ssh_username,
            pk.private_key_content,
            s.server_id
        FROM servers s
        LEFT JOIN server_private_keys spk ON s.id = spk.server_id AND spk.is_primary = true
        LEFT JOIN private_keys pk ON spk.private_key_id = pk.id
        WHERE s.id = ANY($1)
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| DeployTarget {
            id: row.get("id"),
            hostname: row.get::<Option<String>, _>("hostname").unwrap_or_default(),
            ssh_host: row.get::<Option<String>, _>("ssh_host").unwrap_or_default(),
            ssh_port: row.get::<Option<i32>, _>("ssh_port").unwrap_or(22),
            ssh_username: row
                .get::<Option<String>, _>("ssh_username")
                .unwrap_or_default(),
            encrypted_key: row.get("private_key_content"),
            agent_server_id: row.get("server_id"),
        })
        .collect())
}

/// Stored SSH host-key fingerprint, if any.
pub async fn host_key_fingerprint(pool: &PgPool, id: Uuid) -> Result<Option<String>> {
    let row = sqlx::query("SELECT ssh_host_key_fingerprint FROM servers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(StorageError::NotFound { entity: "server" })?;
    Ok(row.get("ssh_host_key_fingerprint"))
}

/// Pin the host-key fingerprint (trust on first use).
pub async fn store_host_key_fingerprint(pool: &PgPool, id: Uuid, fingerprint: &str) -> Result<()> {
    sqlx::query("UPDATE servers SET ssh_host_key_fingerprint = $1 WHERE id = $2")
        .bind(fingerprint)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
