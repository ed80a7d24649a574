//! HTTP surfaces.
//!
//! Handlers are the only place internal errors become HTTP status codes;
//! everything below them returns typed errors.

pub mod certificates;
pub mod ingest;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Service health payload served at `GET /health` on every binary.
pub async fn service_health(service: &'static str) -> Response {
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "service": service})),
    )
        .into_response()
}

/// Spawn a minimal health listener for the headless workers.
///
/// Bind failures only log: a worker without its health port is degraded,
/// not broken.
pub fn spawn_health_server(
    service: &'static str,
    port: u16,
    token: tokio_util::sync::CancellationToken,
) {
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/health", axum::routing::get(move || service_health(service)));
        let addr = format!("0.0.0.0:{port}");

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "could not bind health endpoint");
                return;
            }
        };
        tracing::info!(addr = %addr, "health endpoint listening");

        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
    });
}

/// JSON error body `{"error": ...}`.
pub(crate) fn error_response(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({"error": error}))).into_response()
}

/// JSON error body with a detail field.
pub(crate) fn error_detail(status: StatusCode, error: &str, detail: &str) -> Response {
    (status, Json(json!({"error": error, "detail": detail}))).into_response()
}
