//! Retention cleaner for telemetry rows.
//!
//! Deletes `metrics` and `process_snapshots` rows older than the configured
//! horizon, in bounded batches so every delete is a short transaction.
//! Embedded in the digest binary on a one-minute ticker and also shipped as
//! a one-shot binary. Cleanup is best-effort: failures are logged and never
//! crash the host process.

use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::storage::settings::{self, RetentionSettings};
use crate::storage::{Result, StorageError};

/// Rows deleted per batch; keeps each delete transaction short.
const DELETE_BATCH_SIZE: i64 = 10_000;

/// Ceiling for one cleanup sweep so a slow sweep cannot block the next tick.
pub const SWEEP_DEADLINE: Duration = Duration::from_secs(30);

/// Tick interval when embedded in the digest binary.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Tables swept by the cleaner.
const TABLES: &[&str] = &["metrics", "process_snapshots"];

/// Orchestrates the cleanup jobs.
#[derive(Clone)]
pub struct Cleaner {
    pool: PgPool,
    dry_run: bool,
}

impl Cleaner {
    pub fn new(pool: PgPool, dry_run: bool) -> Self {
        Self { pool, dry_run }
    }

    /// Run one full sweep across all retained tables.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();

        let retention = settings::retention_settings(&self.pool).await?;
        if !retention.enabled {
            info!("retention cleanup is disabled, skipping");
            return Ok(());
        }
        info!(
            retention_hours = retention.retention_hours,
            "starting retention cleanup"
        );

        for table in TABLES {
            self.clean_table(token, table, &retention).await?;
        }

        // Certificate expiry is wall-clock maintenance, not row retention,
        // but it rides the same tick.
        match crate::trust::mark_expired_certificates(&self.pool).await {
            Ok(0) => {}
            Ok(n) => info!(expired = n, "marked expired certificates"),
            Err(e) => warn!(error = %e, "certificate expiry sweep failed"),
        }

        info!(elapsed = ?started.elapsed(), "retention cleanup completed");
        Ok(())
    }

    /// Sweep one table in bounded batches.
    async fn clean_table(
        &self,
        token: &CancellationToken,
        table: &str,
        retention: &RetentionSettings,
    ) -> Result<()> {
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE timestamp < NOW() - make_interval(hours => $1)"
        ))
        .bind(retention.retention_hours as i32)
        .fetch_one(&self.pool)
        .await?;

        if total == 0 {
            info!(table, "no rows past the retention horizon");
            return Ok(());
        }

        if self.dry_run {
            info!(table, rows = total, "dry run: would delete rows");
            return Ok(());
        }

        info!(table, rows = total, "deleting rows past the retention horizon");

        let delete_sql = format!(
            "DELETE FROM {table} WHERE id IN ( \
             SELECT id FROM {table} \
             WHERE timestamp < NOW() - make_interval(hours => $1) \
             ORDER BY timestamp ASC LIMIT $2)"
        );

        let mut deleted_total: i64 = 0;
        loop {
            let result = sqlx::query(&delete_sql)
                .bind(retention.retention_hours as i32)
                .bind(DELETE_BATCH_SIZE)
                .execute(&self.pool)
                .await?;

            let deleted = result.rows_affected() as i64;
            if deleted == 0 {
                break;
            }
            deleted_total += deleted;
            info!(table, batch = deleted, progress = deleted_total, total, "deleted batch");

            if token.is_cancelled() {
                warn!(table, deleted = deleted_total, "cleanup cancelled mid-sweep");
                return Err(StorageError::Cancelled);
            }
        }

        info!(table, deleted = deleted_total, "table sweep complete");
        Ok(())
    }
}

/// One deadline-bounded sweep; errors are logged, never propagated.
pub async fn run_sweep(cleaner: &Cleaner, token: &CancellationToken) {
    match tokio::time::timeout(SWEEP_DEADLINE, cleaner.run(token)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "cleanup failed"),
        Err(_) => warn!("cleanup sweep exceeded deadline"),
    }
}
