//! Wire-contract tests across the telemetry and deployment pipelines:
//! what the ingest edge publishes must be exactly what the digest worker
//! consumes, and the tool summary must reconcile into per-host statuses.

use std::collections::HashMap;

use serde_json::json;

use armada::broker::dlq::{
    dlq_fields, FIELD_FAILED_AT, FIELD_ORIGINAL_MESSAGE_ID, FIELD_ORIGINAL_STREAM,
    FIELD_RETRY_COUNT,
};
use armada::deploy::inventory::{classify_recap, parse_run_summary};
use armada::digest::{parse_envelope, ExporterData, SnapshotEnvelope};

#[test]
fn ingest_envelope_is_digestible() {
    // The edge serialises one envelope per snapshot with exactly these
    // three fields.
    let envelope = SnapshotEnvelope {
        server_id: "00000000-0000-0000-0000-000000000001".to_string(),
        exporter_name: "node_exporter".to_string(),
        snapshot: json!({
            "timestamp": "2025-01-01T00:00:00Z",
            "cpu_cores": 4,
            "memory_total_bytes": 1073741824u64,
        }),
    };
    let wire = serde_json::to_string(&envelope).unwrap();

    let as_value: serde_json::Value = serde_json::from_str(&wire).unwrap();
    let object = as_value.as_object().unwrap();
    assert!(object.contains_key("server_id"));
    assert!(object.contains_key("exporter_name"));
    assert!(object.contains_key("snapshot"));

    // The digest side decodes the same bytes into typed rows.
    let parsed = parse_envelope(&wire).unwrap();
    match ExporterData::from_envelope(&parsed).unwrap() {
        ExporterData::Node(snapshots) => {
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0].cpu_cores, 4);
            assert_eq!(snapshots[0].memory_total_bytes, 1_073_741_824);
        }
        other => panic!("expected node snapshots, got {other:?}"),
    }
}

#[test]
fn poison_message_keeps_original_fields_in_dlq() {
    let mut original = HashMap::new();
    original.insert("type".to_string(), "snapshot".to_string());
    original.insert("payload".to_string(), "{\"broken\": ".to_string());

    let fields = dlq_fields("armada:metrics:stream", "1700000000000-7", &original, 5);
    let map: HashMap<_, _> = fields.into_iter().collect();

    // Originals preserved verbatim.
    assert_eq!(map["type"], "snapshot");
    assert_eq!(map["payload"], "{\"broken\": ");
    // Provenance added.
    assert_eq!(map[FIELD_ORIGINAL_STREAM], "armada:metrics:stream");
    assert_eq!(map[FIELD_ORIGINAL_MESSAGE_ID], "1700000000000-7");
    assert_eq!(map[FIELD_RETRY_COUNT], "5");
    assert!(map.contains_key(FIELD_FAILED_AT));
}

#[test]
fn deployment_with_one_unreachable_host_reconciles() {
    // Tool output shape for a two-host run where one host is unreachable
    // and the tool still exits zero.
    let summary = parse_run_summary(
        r#"{
            "stats": {
                "h1": {"ok": 5, "changed": 2, "unreachable": 0, "failures": 0, "skipped": 0},
                "h2": {"ok": 0, "changed": 0, "unreachable": 1, "failures": 0, "skipped": 0}
            }
        }"#,
    )
    .unwrap();

    let mut results: Vec<(&str, &'static str, bool)> = summary
        .stats
        .iter()
        .map(|(host, recap)| {
            let (status, changed) = classify_recap(recap);
            (host.as_str(), status, changed)
        })
        .collect();
    results.sort();

    assert_eq!(
        results,
        vec![("h1", "success", true), ("h2", "failed", false)]
    );

    let successful = results.iter().filter(|(_, s, _)| *s == "success").count();
    let failed = results.iter().filter(|(_, s, _)| *s == "failed").count();
    let skipped = results.iter().filter(|(_, s, _)| *s == "skipped").count();
    assert_eq!((successful, failed, skipped), (1, 1, 0));
}

#[test]
fn grouped_process_payload_decodes_in_bulk() {
    let envelope = SnapshotEnvelope {
        server_id: "h".to_string(),
        exporter_name: "process_exporter".to_string(),
        snapshot: json!([
            {"timestamp": "2025-01-01T00:00:00Z", "name": "nginx", "num_procs": 2,
             "cpu_seconds_total": 1.5, "memory_bytes": 1024},
            {"timestamp": "2025-01-01T00:00:00Z", "name": "postgres", "num_procs": 8,
             "cpu_seconds_total": 90.0, "memory_bytes": 4096},
        ]),
    };

    match ExporterData::from_envelope(&envelope).unwrap() {
        ExporterData::Process(snapshots) => {
            assert_eq!(snapshots.len(), 2);
            assert_eq!(snapshots[1].name, "postgres");
        }
        other => panic!("expected process snapshots, got {other:?}"),
    }
}
