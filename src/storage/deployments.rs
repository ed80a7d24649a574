//! Deployment job persistence.
//!
//! The `deployments` row is the durable record of a run; the stream entry is
//! only its trigger. Child `deployment_servers` rows carry per-host results,
//! and aggregate counters on the parent are recomputed from the children so
//! they can never drift.

use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use super::Result;

/// Terminal per-host states written after parsing the tool's summary.
pub const HOST_STATUS_SUCCESS: &str = "success";
pub const HOST_STATUS_FAILED: &str = "failed";
pub const HOST_STATUS_SKIPPED: &str = "skipped";

/// Mark a deployment running and record the target count.
pub async fn mark_running(pool: &PgPool, deployment_id: Uuid, total_servers: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE deployments
        SET status = 'running', started_at = NOW(), total_servers = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(total_servers)
    .bind(deployment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Bulk-insert pending child rows, one per targeted host.
pub async fn insert_deployment_servers(
    pool: &PgPool,
    deployment_id: Uuid,
    server_ids: &[Uuid],
) -> Result<()> {
    if server_ids.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::new(
        "INSERT INTO deployment_servers (deployment_id, server_id, status, created_at, updated_at) ",
    );
    builder.push_values(server_ids, |mut row, server_id| {
        row.push_bind(deployment_id)
            .push_bind(server_id)
            .push_bind("pending")
            .push("NOW()")
            .push("NOW()");
    });

    builder.build().execute(pool).await?;
    Ok(())
}

/// Record one host's result.
pub async fn update_server_result(
    pool: &PgPool,
    deployment_id: Uuid,
    server_id: Uuid,
    status: &str,
    changed: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE deployment_servers
        SET status = $1, changed = $2, completed_at = NOW(), updated_at = NOW()
        WHERE deployment_id = $3 AND server_id = $4
        "#,
    )
    .bind(status)
    .bind(changed)
    .bind(deployment_id)
    .bind(server_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recompute the aggregate counters from the child rows.
pub async fn recompute_aggregates(pool: &PgPool, deployment_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE deployments
        SET
            successful_servers = (
                SELECT COUNT(*) FROM deployment_servers
                WHERE deployment_id = $1 AND status = 'success'
            ),
            failed_servers = (
                SELECT COUNT(*) FROM deployment_servers
                WHERE deployment_id = $1 AND status = 'failed'
            ),
            skipped_servers = (
                SELECT COUNT(*) FROM deployment_servers
                WHERE deployment_id = $1 AND status = 'skipped'
            ),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(deployment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move a deployment to its terminal state with the captured output.
pub async fn finish(
    pool: &PgPool,
    deployment_id: Uuid,
    status: &str,
    output: &str,
    error_output: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE deployments
        SET status = $1, completed_at = NOW(), output = $2, error_output = $3, updated_at = NOW()
        WHERE id = $4
        "#,
    )
    .bind(status)
    .bind(output)
    .bind(error_output)
    .bind(deployment_id)
    .execute(pool)
    .await?;
    Ok(())
}
