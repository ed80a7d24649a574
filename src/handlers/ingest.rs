//! Telemetry ingest edge.
//!
//! `POST /metrics/prometheus?server_id=<uuid>` accepts a grouped payload
//! `{ "<exporter_name>": [<snapshot>, ...], ... }`, validates the sender,
//! and publishes one stream entry per snapshot. The edge never touches the
//! database on the ingest path: validation goes through the cached
//! validator and durability is the stream's ordered append, so a burst of
//! agents cannot stall on database latency.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::{error_detail, error_response};
use crate::broker::{Broker, MAX_STREAM_BACKLOG, METRICS_STREAM};
use crate::digest::SnapshotEnvelope;
use crate::validation::ServerIdValidator;

/// Shared state for the ingest routes.
#[derive(Clone)]
pub struct IngestState {
    pub broker: Broker,
    pub validator: ServerIdValidator,
}

/// Build the ingest router.
///
/// With an issuer, the ingest POST additionally requires the forwarded
/// client-certificate headers (edge auth); the stream health endpoint
/// stays open either way.
pub fn router(state: IngestState, mtls: Option<crate::trust::CertIssuer>) -> Router {
    let mut protected: Router<IngestState> =
        Router::new().route("/metrics/prometheus", post(ingest_metrics));
    if let Some(issuer) = mtls {
        protected = protected.route_layer(axum::middleware::from_fn_with_state(
            issuer,
            crate::auth::mtls_auth,
        ));
    }

    let open: Router<IngestState> =
        Router::new().route("/metrics/prometheus/health", get(stream_health));

    protected.merge(open).with_state(state)
}

async fn ingest_metrics(
    State(state): State<IngestState>,
    Query(params): Query<HashMap<String, String>>,
    body: Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Some(server_id_raw) = params.get("server_id") else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "server_id query parameter is required",
        );
    };

    let server_id = match uuid::Uuid::parse_str(server_id_raw) {
        Ok(id) => id,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid server_id format: {e}"),
            );
        }
    };

    // Independent of mTLS: the sender must name a registered host.
    match state.validator.validate(&server_id.to_string()).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(server_id = %server_id, "rejected metrics from unknown server_id");
            return error_detail(
                StatusCode::FORBIDDEN,
                "unknown server_id",
                "server not found",
            );
        }
        Err(e) => {
            error!(error = %e, "server_id validation failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "server validation failed");
        }
    }

    let grouped = match body {
        Ok(Json(Value::Object(map))) => map,
        Ok(Json(_)) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "body must be a JSON object of exporter arrays",
            );
        }
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON format: {e}"));
        }
    };

    // Backpressure before any publish: if digest workers are behind, the
    // agent should retry later rather than grow the backlog.
    match state
        .broker
        .check_backpressure(METRICS_STREAM, MAX_STREAM_BACKLOG)
        .await
    {
        Ok(_) => {}
        Err(crate::broker::BrokerError::Overloaded { len, .. }) => {
            warn!(backlog = len, "metrics stream backlogged, rejecting new metrics");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "metrics stream is backlogged",
                    "pending": len,
                    "retry": "retry after a few seconds",
                })),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "failed to check stream length");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to check stream status",
            );
        }
    }

    let mut published = 0usize;
    let mut first_message_id: Option<String> = None;

    for (exporter_name, raw_snapshots) in grouped {
        let snapshots = match raw_snapshots {
            Value::Array(items) => items,
            other => {
                warn!(exporter = %exporter_name, "exporter payload is not an array: {}", other);
                continue;
            }
        };

        if !matches!(exporter_name.as_str(), "node_exporter" | "process_exporter") {
            warn!(exporter = %exporter_name, count = snapshots.len(), "unknown exporter type, ignoring");
            continue;
        }

        for snapshot in snapshots {
            let envelope = SnapshotEnvelope {
                server_id: server_id.to_string(),
                exporter_name: exporter_name.clone(),
                snapshot,
            };

            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(exporter = %exporter_name, error = %e, "failed to serialize snapshot envelope");
                    continue;
                }
            };

            match state
                .broker
                .xadd(METRICS_STREAM, &[("type", "snapshot"), ("payload", &payload)])
                .await
            {
                Ok(id) => {
                    first_message_id.get_or_insert(id);
                    published += 1;
                }
                Err(e) => {
                    error!(exporter = %exporter_name, error = %e, "failed to publish snapshot to stream");
                }
            }
        }
    }

    let Some(first_message_id) = first_message_id else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to publish any metrics",
        );
    };

    info!(server_id = %server_id, snapshots = published, "published metric snapshots");
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "snapshots": published,
            "server_id": server_id.to_string(),
            "first_message_id": first_message_id,
        })),
    )
        .into_response()
}

async fn stream_health(State(state): State<IngestState>) -> Response {
    let backlog = match state.broker.xlen(METRICS_STREAM).await {
        Ok(len) => len,
        Err(e) => {
            error!(error = %e, "stream health check failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unhealthy", "error": "stream unavailable"})),
            )
                .into_response();
        }
    };

    let status = if backlog > MAX_STREAM_BACKLOG {
        "degraded"
    } else {
        "healthy"
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "stream_pending": backlog,
            "max_backlog": MAX_STREAM_BACKLOG,
            "format": "prometheus",
        })),
    )
        .into_response()
}
