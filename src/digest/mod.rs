//! Digest worker: drains the metrics stream into the database.
//!
//! A long-lived consumer in the `submarines-digest` group. Each entry is
//! applied inside a single transaction (snapshot rows plus the host
//! liveness bump) and only then ACKed and deleted from the stream, giving
//! at-least-once delivery: an entry either commits and disappears, or stays
//! pending and is redelivered. Entries that keep failing are demoted to the
//! dead-letter stream once their delivery count exhausts the retry budget.
//!
//! Consumer names incorporate the host identity so the worker scales
//! horizontally without collisions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, StreamMessage, METRICS_DLQ_STREAM, METRICS_STREAM};
use crate::storage::metrics::{
    insert_metric_snapshot, insert_process_snapshots, MetricSnapshot, ProcessSnapshot,
};
use crate::storage::{self, servers, StorageError};
use crate::utils::retry::{with_exponential_backoff, RetryConfig};

/// Consumer group for digest workers.
pub const CONSUMER_GROUP: &str = "submarines-digest";

/// Entries read per cycle.
pub const BATCH_SIZE: usize = 100;

/// Delivery attempts before an entry is demoted to the DLQ.
pub const MAX_RETRIES: u64 = 5;

/// Pending entries inspected per poison sweep.
const PENDING_RECLAIM_COUNT: usize = 100;

/// Ceiling for one polling cycle.
const CYCLE_DEADLINE: Duration = Duration::from_secs(30);

/// Ceiling for the per-cycle health probes.
const HEALTH_DEADLINE: Duration = Duration::from_secs(5);

/// Idle pause when a cycle saw no entries.
const IDLE_SLEEP: Duration = Duration::from_secs(5);

/// Per-snapshot stream payload: `{server_id, exporter_name, snapshot}`.
///
/// `snapshot` stays raw JSON here; the exporter name is the tag that picks
/// the typed shape at apply time. Unknown tags are logged and skipped,
/// never fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub server_id: String,
    pub exporter_name: String,
    pub snapshot: Value,
}

/// Typed view of an envelope, keyed by the exporter tag.
#[derive(Debug)]
pub enum ExporterData {
    Node(Vec<MetricSnapshot>),
    Process(Vec<ProcessSnapshot>),
    Unknown { exporter: String },
}

/// Digest failures.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("backing store unhealthy: {0}")]
    Unhealthy(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<sqlx::Error> for DigestError {
    fn from(e: sqlx::Error) -> Self {
        DigestError::Storage(StorageError::Database(e))
    }
}

/// Parse the stream payload field into an envelope.
pub fn parse_envelope(payload: &str) -> Result<SnapshotEnvelope, DigestError> {
    serde_json::from_str(payload).map_err(|e| DigestError::Payload(e.to_string()))
}

impl ExporterData {
    /// Decode the envelope's snapshot under its exporter tag.
    ///
    /// Accepts a single snapshot object or an array of them, so grouped
    /// payloads decode the same as the per-snapshot wire format.
    pub fn from_envelope(envelope: &SnapshotEnvelope) -> Result<Self, DigestError> {
        fn decode_many<T: serde::de::DeserializeOwned>(
            snapshot: &Value,
        ) -> Result<Vec<T>, DigestError> {
            let items = match snapshot {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(|e| DigestError::Payload(e.to_string())))
                .collect()
        }

        match envelope.exporter_name.as_str() {
            "node_exporter" => Ok(ExporterData::Node(decode_many(&envelope.snapshot)?)),
            "process_exporter" => Ok(ExporterData::Process(decode_many(&envelope.snapshot)?)),
            other => Ok(ExporterData::Unknown {
                exporter: other.to_string(),
            }),
        }
    }
}

/// Apply one stream entry in a single transaction.
///
/// Rolls back on any failure so the un-ACKed entry is redelivered intact.
/// Redelivery of a committed entry inserts duplicate rows; retention bounds
/// the volume, so no dedup is attempted.
pub async fn apply_envelope(pool: &PgPool, envelope: &SnapshotEnvelope) -> Result<(), DigestError> {
    let data = ExporterData::from_envelope(envelope)?;

    let mut tx = pool.begin().await?;

    match data {
        ExporterData::Node(snapshots) => {
            for snapshot in &snapshots {
                insert_metric_snapshot(&mut *tx, &envelope.server_id, snapshot).await?;
            }
        }
        ExporterData::Process(snapshots) => {
            insert_process_snapshots(&mut *tx, &envelope.server_id, &snapshots).await?;
        }
        ExporterData::Unknown { exporter } => {
            warn!(exporter = %exporter, server_id = %envelope.server_id, "unknown exporter type, skipping");
        }
    }

    let touched = servers::touch_last_seen(&mut *tx, &envelope.server_id).await?;
    if touched == 0 {
        warn!(server_id = %envelope.server_id, "host not found, last_seen_at not updated");
    }

    tx.commit().await?;
    Ok(())
}

/// The digest worker loop.
pub struct DigestWorker {
    pool: PgPool,
    broker: Broker,
    consumer: String,
}

impl DigestWorker {
    pub fn new(pool: PgPool, broker: Broker, consumer: String) -> Self {
        Self {
            pool,
            broker,
            consumer,
        }
    }

    /// Run until the token is cancelled. The in-flight cycle finishes (or
    /// rolls back) before the loop exits.
    pub async fn run(&self, token: CancellationToken) {
        // The broker may still be warming on first deployment; group
        // creation is idempotent, so retrying is safe.
        let created = with_exponential_backoff(
            &token,
            &RetryConfig::default(),
            "create digest consumer group",
            || self.broker.xgroup_create(METRICS_STREAM, CONSUMER_GROUP, "0"),
        )
        .await;
        if let Err(e) = created {
            error!(error = %e, "could not create consumer group, exiting");
            return;
        }

        info!(consumer = %self.consumer, "digest worker ready");

        while !token.is_cancelled() {
            let cycle = tokio::time::timeout(CYCLE_DEADLINE, self.cycle(&token));
            match cycle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "digest cycle failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
                Err(_) => warn!("digest cycle exceeded deadline"),
            }
        }

        info!("digest worker stopped");
    }

    /// One polling cycle: health probes, poison sweep, batch read, apply,
    /// ACK and delete.
    async fn cycle(&self, token: &CancellationToken) -> Result<(), DigestError> {
        let healthy = tokio::time::timeout(HEALTH_DEADLINE, async {
            storage::health_check(&self.pool).await?;
            self.broker.health_check().await.map_err(DigestError::from)
        })
        .await;
        match healthy {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(DigestError::Unhealthy("health check timed out".to_string())),
        }

        self.reclaim_poison_messages().await?;

        // Drain this consumer's in-flight entries before taking new ones.
        let mut messages = self
            .broker
            .xread_group(CONSUMER_GROUP, &self.consumer, METRICS_STREAM, "0", BATCH_SIZE)
            .await?;
        if messages.len() < BATCH_SIZE {
            let new = self
                .broker
                .xread_group(
                    CONSUMER_GROUP,
                    &self.consumer,
                    METRICS_STREAM,
                    ">",
                    BATCH_SIZE - messages.len(),
                )
                .await?;
            messages.extend(new);
        }

        if messages.is_empty() {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
            return Ok(());
        }

        debug!(count = messages.len(), "read stream entries");

        let mut applied = Vec::new();
        let mut failed = 0usize;
        for message in &messages {
            match self.apply_message(message).await {
                Ok(()) => applied.push(message.id.clone()),
                Err(e) => {
                    // No ACK: the entry stays pending and will be
                    // redelivered, then demoted to the DLQ if it keeps
                    // failing.
                    error!(message_id = %message.id, error = %e, "failed to process stream entry");
                    failed += 1;
                }
            }
        }

        self.broker
            .xack(METRICS_STREAM, CONSUMER_GROUP, &applied)
            .await?;
        self.broker.xdel(METRICS_STREAM, &applied).await?;

        if !applied.is_empty() {
            info!(applied = applied.len(), "committed metric snapshots");
        }
        if failed > 0 {
            warn!(failed, "stream entries left for redelivery");
        }

        Ok(())
    }

    async fn apply_message(&self, message: &StreamMessage) -> Result<(), DigestError> {
        let payload = message
            .field("payload")
            .ok_or_else(|| DigestError::Payload("missing payload field".to_string()))?;
        let envelope = parse_envelope(payload)?;
        apply_envelope(&self.pool, &envelope).await
    }

    /// Demote entries whose delivery count exhausted the retry budget.
    ///
    /// The poison entry is copied verbatim (plus provenance fields) to the
    /// DLQ stream, then ACKed and deleted on the origin so it stops being
    /// redelivered.
    async fn reclaim_poison_messages(&self) -> Result<(), DigestError> {
        let pending = self
            .broker
            .xpending(METRICS_STREAM, CONSUMER_GROUP, PENDING_RECLAIM_COUNT)
            .await?;

        for entry in pending {
            if entry.delivery_count < MAX_RETRIES {
                continue;
            }

            let originals = self
                .broker
                .xrange_ids(METRICS_STREAM, std::slice::from_ref(&entry.id))
                .await?;

            match originals.first() {
                Some(original) => {
                    self.broker
                        .move_to_dlq(
                            METRICS_STREAM,
                            METRICS_DLQ_STREAM,
                            &entry.id,
                            &original.fields,
                            entry.delivery_count,
                        )
                        .await?;
                }
                None => {
                    // Entry already deleted from the stream; just release it.
                    warn!(message_id = %entry.id, "poison entry no longer in stream");
                }
            }

            self.broker
                .xack(METRICS_STREAM, CONSUMER_GROUP, std::slice::from_ref(&entry.id))
                .await?;
            self.broker
                .xdel(METRICS_STREAM, std::slice::from_ref(&entry.id))
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips() {
        let envelope = SnapshotEnvelope {
            server_id: "00000000-0000-0000-0000-000000000001".to_string(),
            exporter_name: "node_exporter".to_string(),
            snapshot: json!({"timestamp": "2025-01-01T00:00:00Z", "cpu_cores": 4}),
        };

        let wire = serde_json::to_string(&envelope).unwrap();
        let parsed = parse_envelope(&wire).unwrap();
        assert_eq!(parsed.server_id, envelope.server_id);
        assert_eq!(parsed.exporter_name, "node_exporter");
    }

    #[test]
    fn node_exporter_decodes_single_object() {
        let envelope = SnapshotEnvelope {
            server_id: "h".to_string(),
            exporter_name: "node_exporter".to_string(),
            snapshot: json!({
                "timestamp": "2025-01-01T00:00:00Z",
                "cpu_cores": 4,
                "memory_total_bytes": 1073741824u64,
            }),
        };

        match ExporterData::from_envelope(&envelope).unwrap() {
            ExporterData::Node(snapshots) => {
                assert_eq!(snapshots.len(), 1);
                assert_eq!(snapshots[0].cpu_cores, 4);
            }
            other => panic!("expected node data, got {other:?}"),
        }
    }

    #[test]
    fn node_exporter_decodes_grouped_array() {
        let envelope = SnapshotEnvelope {
            server_id: "h".to_string(),
            exporter_name: "node_exporter".to_string(),
            snapshot: json!([
                {"timestamp": "2025-01-01T00:00:00Z", "cpu_cores": 2},
                {"timestamp": "2025-01-01T00:01:00Z", "cpu_cores": 2},
            ]),
        };

        match ExporterData::from_envelope(&envelope).unwrap() {
            ExporterData::Node(snapshots) => assert_eq!(snapshots.len(), 2),
            other => panic!("expected node data, got {other:?}"),
        }
    }

    #[test]
    fn process_exporter_decodes_flat_snapshots() {
        let envelope = SnapshotEnvelope {
            server_id: "h".to_string(),
            exporter_name: "process_exporter".to_string(),
            snapshot: json!({
                "timestamp": "2025-01-01T00:00:00Z",
                "name": "postgres",
                "num_procs": 8,
                "cpu_seconds_total": 321.5,
                "memory_bytes": 2147483648u64,
            }),
        };

        match ExporterData::from_envelope(&envelope).unwrap() {
            ExporterData::Process(snapshots) => {
                assert_eq!(snapshots.len(), 1);
                assert_eq!(snapshots[0].name, "postgres");
            }
            other => panic!("expected process data, got {other:?}"),
        }
    }

    #[test]
    fn unknown_exporter_is_not_fatal() {
        let envelope = SnapshotEnvelope {
            server_id: "h".to_string(),
            exporter_name: "gpu_exporter".to_string(),
            snapshot: json!([{"anything": true}]),
        };

        match ExporterData::from_envelope(&envelope).unwrap() {
            ExporterData::Unknown { exporter } => assert_eq!(exporter, "gpu_exporter"),
            other => panic!("expected unknown data, got {other:?}"),
        }
    }

    #[test]
    fn malformed_snapshot_is_a_payload_error() {
        let envelope = SnapshotEnvelope {
            server_id: "h".to_string(),
            exporter_name: "node_exporter".to_string(),
            snapshot: json!({"timestamp": "not-a-timestamp"}),
        };

        assert!(matches!(
            ExporterData::from_envelope(&envelope),
            Err(DigestError::Payload(_))
        ));
    }

    #[test]
    fn garbage_payload_is_a_payload_error() {
        assert!(matches!(
            parse_envelope("{not json"),
            Err(DigestError::Payload(_))
        ));
    }
}
