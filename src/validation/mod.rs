//! Server-id validation with broker-side caching.
//!
//! The ingest edge calls this on every agent post, so the database sits
//! behind a cache. Both positive and negative results are cached with the
//! same TTL: flood traffic from unknown agents must not hammer the
//! database any harder than known agents do.

use std::time::Duration;

use sqlx::PgPool;
use tracing::warn;

use crate::broker::Broker;
use crate::storage::{self, servers};

/// Default cache lifetime for both outcomes.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Cached `server_id` existence check.
#[derive(Clone)]
pub struct ServerIdValidator {
    pool: PgPool,
    broker: Broker,
    cache_ttl: Duration,
}

impl ServerIdValidator {
    pub fn new(pool: PgPool, broker: Broker, cache_ttl: Duration) -> Self {
        Self {
            pool,
            broker,
            cache_ttl,
        }
    }

    /// Cache key for a server id.
    pub fn cache_key(server_id: &str) -> String {
        format!("server:valid:{server_id}")
    }

    /// Does this `server_id` exist?
    ///
    /// Checks the cache first; on a miss, queries the database and caches
    /// the boolean. Cache write failures are swallowed — the database
    /// answer is still authoritative.
    pub async fn validate(&self, server_id: &str) -> Result<bool, storage::StorageError> {
        let key = Self::cache_key(server_id);

        match self.broker.get(&key).await {
            Ok(Some(cached)) => return Ok(cached == "true"),
            Ok(None) => {}
            Err(e) => warn!(server_id, error = %e, "validator cache read failed"),
        }

        let exists = servers::server_exists(&self.pool, server_id).await?;

        let value = if exists { "true" } else { "false" };
        if let Err(e) = self.broker.set_ex(&key, value, self.cache_ttl).await {
            warn!(server_id, error = %e, "validator cache write failed");
        }

        Ok(exists)
    }

    /// Drop the cached result after a host is registered or deleted.
    pub async fn invalidate(&self, server_id: &str) -> Result<(), crate::broker::BrokerError> {
        self.broker.del(&Self::cache_key(server_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_format() {
        assert_eq!(
            ServerIdValidator::cache_key("00000000-0000-0000-0000-000000000001"),
            "server:valid:00000000-0000-0000-0000-000000000001"
        );
    }
}
