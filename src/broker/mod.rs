//! Stream broker client.
//!
//! Thin wrapper over the Redis-compatible streams service shared by every
//! process: ordered streams with consumer groups for the telemetry and
//! deployment pipelines, plus plain keys with TTL for the server-id
//! validator cache.
//!
//! Streams are never trimmed on write; backpressure is enforced at the
//! application level (reject when the stream is too long) and entries are
//! deleted only after digest workers have ACKed them.

pub mod dlq;

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info};

/// Metrics stream written by the ingest edge, drained by digest workers.
pub const METRICS_STREAM: &str = "armada:metrics:stream";

/// Dead-letter stream for poison metrics messages.
pub const METRICS_DLQ_STREAM: &str = "armada:metrics:dlq";

/// Deployment job stream written by the operator surface.
pub const DEPLOYMENTS_STREAM: &str = "armada:deployments:stream";

/// Reject new ingest traffic once the stream backlog exceeds this many
/// entries; digest workers are falling behind.
pub const MAX_STREAM_BACKLOG: i64 = 10_000;

/// How long a blocking group read waits for new entries.
const READ_BLOCK_MS: usize = 5_000;

/// Broker failures.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stream {stream} is overloaded: {len} entries (max {max})")]
    Overloaded { stream: String, len: i64, max: i64 },

    #[error("broker health check mismatch: wrote {wrote:?}, read {read:?}")]
    HealthMismatch { wrote: String, read: Option<String> },
}

/// One entry read from a stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    /// Field accessor; missing fields read as `None`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// One entry from the pending-entries list of a consumer group.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub delivery_count: u64,
    pub idle: Duration,
}

/// Shared broker client. Cheap to clone; safe for concurrent use.
#[derive(Clone)]
pub struct Broker {
    conn: ConnectionManager,
}

impl Broker {
    /// Connect and verify the connection with a PING.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("connected to stream broker");

        Ok(Self { conn })
    }

    /// Read/write health probe: set, get back, compare, delete.
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let key = "health:check";
        let value = "ok".to_string();

        let _: () = conn.set(key, &value).await?;
        let read: Option<String> = conn.get(key).await?;
        let _: () = conn.del(key).await?;

        if read.as_deref() != Some(value.as_str()) {
            return Err(BrokerError::HealthMismatch { wrote: value, read });
        }
        Ok(())
    }

    /// Append an entry to a stream. Returns the new entry id.
    pub async fn xadd(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, BrokerError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    /// Number of entries currently in the stream.
    pub async fn xlen(&self, stream: &str) -> Result<i64, BrokerError> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.xlen(stream).await?;
        Ok(len)
    }

    /// Reject when the stream backlog exceeds `max`.
    pub async fn check_backpressure(&self, stream: &str, max: i64) -> Result<i64, BrokerError> {
        let len = self.xlen(stream).await?;
        if len > max {
            return Err(BrokerError::Overloaded {
                stream: stream.to_string(),
                len,
                max,
            });
        }
        Ok(len)
    }

    /// Create a consumer group with MKSTREAM, ignoring "group already
    /// exists" so the call is idempotent.
    pub async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;

        match created {
            Ok(_) => {
                info!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read up to `count` entries for a consumer group.
    ///
    /// `id` is `">"` for new deliveries or `"0"` for this consumer's
    /// in-flight entries. Blocks up to five seconds when reading new
    /// deliveries; an empty reply is not an error.
    pub async fn xread_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        id: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(READ_BLOCK_MS);

        let reply: StreamReadReply = conn.xread_options(&[stream], &[id], &opts).await?;

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = HashMap::with_capacity(entry.map.len());
                for name in entry.map.keys() {
                    if let Some(value) = entry.get::<String>(name) {
                        fields.insert(name.clone(), value);
                    }
                }
                messages.push(StreamMessage {
                    id: entry.id,
                    fields,
                });
            }
        }

        Ok(messages)
    }

    /// Acknowledge entries in a consumer group.
    pub async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, ids).await?;
        Ok(())
    }

    /// Delete entries from the stream so its length stays bounded to
    /// unprocessed work.
    pub async fn xdel(&self, stream: &str, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xdel(stream, ids).await?;
        Ok(())
    }

    /// Pending entries with delivery counts for a consumer group.
    pub async fn xpending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                delivery_count: p.times_delivered as u64,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
            })
            .collect())
    }

    /// Fetch single entries by id (used to recover full field data for DLQ
    /// moves). Missing ids are skipped.
    pub async fn xrange_ids(
        &self,
        stream: &str,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut messages = Vec::new();

        for id in ids {
            let reply: redis::streams::StreamRangeReply =
                conn.xrange(stream, id.as_str(), id.as_str()).await?;
            for entry in reply.ids {
                let mut fields = HashMap::with_capacity(entry.map.len());
                for name in entry.map.keys() {
                    if let Some(value) = entry.get::<String>(name) {
                        fields.insert(name.clone(), value);
                    }
                }
                messages.push(StreamMessage {
                    id: entry.id,
                    fields,
                });
            }
        }

        Ok(messages)
    }

    /// Range over a stream from the beginning (DLQ inspection).
    pub async fn xrange_head(
        &self,
        stream: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamRangeReply =
            conn.xrange_count(stream, "-", "+", count).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| {
                let mut fields = HashMap::with_capacity(entry.map.len());
                for name in entry.map.keys() {
                    if let Some(value) = entry.get::<String>(name) {
                        fields.insert(name.clone(), value);
                    }
                }
                StreamMessage {
                    id: entry.id,
                    fields,
                }
            })
            .collect())
    }

    /// Plain GET for the validator cache.
    pub async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// SET with expiry for the validator cache.
    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    /// DEL for cache invalidation.
    pub async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require a running Redis-compatible service.
    // Run with: cargo test -- --ignored

    #[tokio::test]
    #[ignore]
    async fn stream_round_trip() {
        let broker = Broker::connect("redis://localhost:6379")
            .await
            .expect("broker unavailable");

        let stream = "armada:test:stream";
        broker
            .xgroup_create(stream, "test-group", "0")
            .await
            .unwrap();
        // Idempotent: second create on an existing group must not error.
        broker
            .xgroup_create(stream, "test-group", "0")
            .await
            .unwrap();

        let id = broker
            .xadd(stream, &[("type", "snapshot"), ("payload", "{}")])
            .await
            .unwrap();

        let messages = broker
            .xread_group("test-group", "test-consumer", stream, ">", 10)
            .await
            .unwrap();
        assert!(messages.iter().any(|m| m.id == id));

        broker.xack(stream, "test-group", &[id.clone()]).await.unwrap();
        broker.xdel(stream, &[id]).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn backpressure_threshold_is_exclusive() {
        let broker = Broker::connect("redis://localhost:6379")
            .await
            .expect("broker unavailable");

        let stream = "armada:test:backpressure";
        let id = broker.xadd(stream, &[("k", "v")]).await.unwrap();

        // Length exactly at the limit passes; one above rejects.
        broker.check_backpressure(stream, 1).await.unwrap();
        assert!(matches!(
            broker.check_backpressure(stream, 0).await,
            Err(BrokerError::Overloaded { .. })
        ));

        broker.xdel(stream, &[id]).await.unwrap();
    }
}
