//! Telemetry snapshot persistence.
//!
//! Snapshots are immutable once written and never updated; the retention
//! cleaner is the only thing that removes them. Writes for one stream entry
//! happen inside a single transaction together with the host liveness bump,
//! so a redelivered entry either fully applied or did not apply at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, QueryBuilder};

use super::Result;

/// One system-level snapshot from the host-probing exporter. Raw counters
/// and gauges only; rates and percentages are derived at read time by the
/// operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,

    // CPU counters (seconds)
    pub cpu_idle_seconds: f64,
    pub cpu_iowait_seconds: f64,
    pub cpu_system_seconds: f64,
    pub cpu_user_seconds: f64,
    pub cpu_steal_seconds: f64,
    pub cpu_cores: i32,

    // Memory gauges (bytes)
    pub memory_total_bytes: i64,
    pub memory_available_bytes: i64,
    pub memory_free_bytes: i64,
    pub memory_cached_bytes: i64,
    pub memory_buffers_bytes: i64,
    pub memory_active_bytes: i64,
    pub memory_inactive_bytes: i64,

    // Swap gauges (bytes)
    pub swap_total_bytes: i64,
    pub swap_free_bytes: i64,
    pub swap_cached_bytes: i64,

    // Root filesystem gauges (bytes)
    pub disk_total_bytes: i64,
    pub disk_free_bytes: i64,
    pub disk_available_bytes: i64,

    // Disk I/O counters
    pub disk_reads_completed_total: i64,
    pub disk_writes_completed_total: i64,
    pub disk_read_bytes_total: i64,
    pub disk_written_bytes_total: i64,
    pub disk_io_time_seconds_total: f64,

    // Network counters
    pub network_receive_bytes_total: i64,
    pub network_transmit_bytes_total: i64,
    pub network_receive_packets_total: i64,
    pub network_transmit_packets_total: i64,
    pub network_receive_errs_total: i64,
    pub network_transmit_errs_total: i64,
    pub network_receive_drop_total: i64,
    pub network_transmit_drop_total: i64,

    // Load average
    pub load_1min: f64,
    pub load_5min: f64,
    pub load_15min: f64,

    // Process counts
    pub processes_running: i32,
    pub processes_blocked: i32,
    pub processes_total: i32,

    pub uptime_seconds: i64,
}

impl Default for MetricSnapshot {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            cpu_idle_seconds: 0.0,
            cpu_iowait_seconds: 0.0,
            cpu_system_seconds: 0.0,
            cpu_user_seconds: 0.0,
            cpu_steal_seconds: 0.0,
            cpu_cores: 0,
            memory_total_bytes: 0,
            memory_available_bytes: 0,
            memory_free_bytes: 0,
            memory_cached_bytes: 0,
            memory_buffers_bytes: 0,
            memory_active_bytes: 0,
            memory_inactive_bytes: 0,
            swap_total_bytes: 0,
            swap_free_bytes: 0,
            swap_cached_bytes: 0,
            disk_total_bytes: 0,
            disk_free_bytes: 0,
            disk_available_bytes: 0,
            disk_reads_completed_total: 0,
            disk_writes_completed_total: 0,
            disk_read_bytes_total: 0,
            disk_written_bytes_total: 0,
            disk_io_time_seconds_total: 0.0,
            network_receive_bytes_total: 0,
            network_transmit_bytes_total: 0,
            network_receive_packets_total: 0,
            network_transmit_packets_total: 0,
            network_receive_errs_total: 0,
            network_transmit_errs_total: 0,
            network_receive_drop_total: 0,
            network_transmit_drop_total: 0,
            load_1min: 0.0,
            load_5min: 0.0,
            load_15min: 0.0,
            processes_running: 0,
            processes_blocked: 0,
            processes_total: 0,
            uptime_seconds: 0,
        }
    }
}

/// One process-group snapshot from the process exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Process group name.
    pub name: String,
    pub num_procs: i32,
    /// Cumulative CPU time (counter).
    pub cpu_seconds_total: f64,
    /// Resident memory (RSS).
    pub memory_bytes: i64,
}

impl Default for ProcessSnapshot {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            name: String::new(),
            num_procs: 0,
            cpu_seconds_total: 0.0,
            memory_bytes: 0,
        }
    }
}

/// Insert one system snapshot row.
pub async fn insert_metric_snapshot(
    conn: &mut PgConnection,
    server_id: &str,
    snapshot: &MetricSnapshot,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO metrics (
            server_id, timestamp,
            cpu_idle_seconds, cpu_iowait_seconds, cpu_system_seconds,
            cpu_user_seconds, cpu_steal_seconds, cpu_cores,
            memory_total_bytes, memory_available_bytes, memory_free_bytes,
            memory_cached_bytes, memory_buffers_bytes, memory_active_bytes,
            memory_inactive_bytes,
            swap_total_bytes, swap_free_bytes, swap_cached_bytes,
            disk_total_bytes, disk_free_bytes, disk_available_bytes,
            disk_reads_completed_total, disk_writes_completed_total,
            disk_read_bytes_total, disk_written_bytes_total,
            disk_io_time_seconds_total,
            network_receive_bytes_total, network_transmit_bytes_total,
            network_receive_packets_total, network_transmit_packets_total,
            network_receive_errs_total, network_transmit_errs_total,
            network_receive_drop_total, network_transmit_drop_total,
            load_1min, load_5min, load_15min,
            processes_running, processes_blocked, processes_total,
            uptime_seconds
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
            $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
            $31, $32, $33, $34, $35, $36, $37, $38, $39, $40, $41
        )
        "#,
    )
    .bind(server_id)
    .bind(snapshot.timestamp)
    .bind(snapshot.cpu_idle_seconds)
    .bind(snapshot.cpu_iowait_seconds)
    .bind(snapshot.cpu_system_seconds)
    .bind(snapshot.cpu_user_seconds)
    .bind(snapshot.cpu_steal_seconds)
    .bind(snapshot.cpu_cores)
    .bind(snapshot.memory_total_bytes)
    .bind(snapshot.memory_available_bytes)
    .bind(snapshot.memory_free_bytes)
    .bind(snapshot.memory_cached_bytes)
    .bind(snapshot.memory_buffers_bytes)
    .bind(snapshot.memory_active_bytes)
    .bind(snapshot.memory_inactive_bytes)
    .bind(snapshot.swap_total_bytes)
    .bind(snapshot.swap_free_bytes)
    .bind(snapshot.swap_cached_bytes)
    .bind(snapshot.disk_total_bytes)
    .bind(snapshot.disk_free_bytes)
    .bind(snapshot.disk_available_bytes)
    .bind(snapshot.disk_reads_completed_total)
    .bind(snapshot.disk_writes_completed_total)
    .bind(snapshot.disk_read_bytes_total)
    .bind(snapshot.disk_written_bytes_total)
    .bind(snapshot.disk_io_time_seconds_total)
    .bind(snapshot.network_receive_bytes_total)
    .bind(snapshot.network_transmit_bytes_total)
    .bind(snapshot.network_receive_packets_total)
    .bind(snapshot.network_transmit_packets_total)
    .bind(snapshot.network_receive_errs_total)
    .bind(snapshot.network_transmit_errs_total)
    .bind(snapshot.network_receive_drop_total)
    .bind(snapshot.network_transmit_drop_total)
    .bind(snapshot.load_1min)
    .bind(snapshot.load_5min)
    .bind(snapshot.load_15min)
    .bind(snapshot.processes_running)
    .bind(snapshot.processes_blocked)
    .bind(snapshot.processes_total)
    .bind(snapshot.uptime_seconds)
    .execute(conn)
    .await?;

    Ok(())
}

/// Bulk-insert process snapshots in one multi-VALUES statement.
pub async fn insert_process_snapshots(
    conn: &mut PgConnection,
    server_id: &str,
    snapshots: &[ProcessSnapshot],
) -> Result<()> {
    if snapshots.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::new(
        "INSERT INTO process_snapshots \
         (server_id, timestamp, process_name, num_procs, cpu_seconds_total, memory_bytes) ",
    );
    builder.push_values(snapshots, |mut row, s| {
        row.push_bind(server_id)
            .push_bind(s.timestamp)
            .push_bind(&s.name)
            .push_bind(s.num_procs)
            .push_bind(s.cpu_seconds_total)
            .push_bind(s.memory_bytes);
    });

    builder.build().execute(conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_snapshot_tolerates_sparse_payloads() {
        let snapshot: MetricSnapshot = serde_json::from_str(
            r#"{"timestamp":"2025-01-01T00:00:00Z","cpu_cores":4,"memory_total_bytes":1073741824}"#,
        )
        .unwrap();

        assert_eq!(snapshot.cpu_cores, 4);
        assert_eq!(snapshot.memory_total_bytes, 1_073_741_824);
        assert_eq!(snapshot.cpu_idle_seconds, 0.0);
        assert_eq!(snapshot.uptime_seconds, 0);
    }

    #[test]
    fn process_snapshot_parses_flat_shape() {
        let snapshot: ProcessSnapshot = serde_json::from_str(
            r#"{"timestamp":"2025-01-01T00:00:00Z","name":"nginx","num_procs":3,
                "cpu_seconds_total":12.5,"memory_bytes":104857600}"#,
        )
        .unwrap();

        assert_eq!(snapshot.name, "nginx");
        assert_eq!(snapshot.num_procs, 3);
        assert_eq!(snapshot.memory_bytes, 104_857_600);
    }
}
