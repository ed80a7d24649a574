//! PostgreSQL persistence.
//!
//! All durable state lives here. Each service owns its tables and touches
//! nothing else; cross-service coordination happens through the broker
//! streams, never through write-path joins.

pub mod deployments;
pub mod metrics;
pub mod servers;
pub mod sessions;
pub mod settings;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open the process-wide connection pool.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await?;

    info!("connected to database");
    Ok(pool)
}

/// Liveness probe used by the worker cycles.
pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await?;
    Ok(())
}
