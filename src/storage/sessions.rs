//! Shell session audit records.
//!
//! Every shell session writes a start row the moment the operator asks to
//! authenticate, and a terminal update when it ends, whether the SSH dial
//! succeeded or not. Audit writes are best-effort: a failed insert is logged
//! but never blocks the session itself.

use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::Result;

/// Fields captured at session start.
#[derive(Debug, Clone, Default)]
pub struct SessionStart {
    pub session_id: String,
    pub server_id: Uuid,
    pub operator: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub auth_method: String,
    pub ssh_username: String,
    pub ssh_host: String,
    pub ssh_port: i32,
    pub host_key_fingerprint: Option<String>,
}

/// Insert the session start row with status `active`.
pub async fn log_session_start(pool: &PgPool, start: &SessionStart) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ssh_sessions (
            session_id, server_id, operator, ip_address, user_agent,
            started_at, status, auth_method, ssh_username, ssh_host, ssh_port,
            host_key_fingerprint
        ) VALUES ($1, $2, $3, $4, $5, NOW(), 'active', $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&start.session_id)
    .bind(start.server_id)
    .bind(&start.operator)
    .bind(&start.ip_address)
    .bind(&start.user_agent)
    .bind(&start.auth_method)
    .bind(&start.ssh_username)
    .bind(&start.ssh_host)
    .bind(start.ssh_port)
    .bind(&start.host_key_fingerprint)
    .execute(pool)
    .await?;
    Ok(())
}

/// Close the audit record with a terminal status and disconnect reason.
pub async fn log_session_end(
    pool: &PgPool,
    session_id: &str,
    status: &str,
    disconnect_reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ssh_sessions
        SET ended_at = NOW(),
            duration_seconds = EXTRACT(EPOCH FROM (NOW() - started_at))::INTEGER,
            status = $2,
            disconnect_reason = $3,
            updated_at = NOW()
        WHERE session_id = $1
        "#,
    )
    .bind(session_id)
    .bind(status)
    .bind(disconnect_reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a host-key fingerprint on an already-started session row.
pub async fn record_fingerprint(pool: &PgPool, session_id: &str, fingerprint: &str) {
    let result = sqlx::query(
        "UPDATE ssh_sessions SET host_key_fingerprint = $2, updated_at = NOW() WHERE session_id = $1",
    )
    .bind(session_id)
    .bind(fingerprint)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!(session_id, error = %e, "failed to record host-key fingerprint on audit row");
    }
}
