//! Internal trust API.
//!
//! Operator-surface endpoints for CA and client certificate management.
//! These routes are internal: the public edge never exposes `/internal`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::error;

use super::error_response;
use crate::storage::servers;
use crate::trust::{CertIssuer, TrustError};

/// Issued client certificates default to one year.
pub const DEFAULT_CERT_VALIDITY_DAYS: i64 = 365;
/// A CA defaults to ten years.
pub const DEFAULT_CA_VALIDITY_DAYS: i64 = 3650;

#[derive(Clone)]
pub struct TrustState {
    pub pool: PgPool,
    pub issuer: CertIssuer,
}

pub fn router(state: TrustState) -> Router {
    Router::new()
        .route("/internal/ca", get(list_cas))
        .route("/internal/ca/create", post(create_ca))
        .route("/internal/ca/activate", post(activate_ca))
        .route("/internal/certificates/generate", post(generate_certificate))
        .route("/internal/certificates/renew", post(renew_certificate))
        .route("/internal/certificates/revoke", post(revoke_certificate))
        .route("/internal/certificates/expiring", get(expiring_certificates))
        .route("/internal/certificates/:server_id", get(active_certificate))
        .route(
            "/internal/certificates/:server_id/history",
            get(certificate_history),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateCaRequest {
    name: String,
    validity_days: Option<i64>,
}

async fn create_ca(
    State(state): State<TrustState>,
    Json(req): Json<CreateCaRequest>,
) -> Response {
    if req.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name is required");
    }
    let validity_days = req.validity_days.unwrap_or(DEFAULT_CA_VALIDITY_DAYS);

    let ca_manager = state.issuer.ca_manager();
    let mut ca = match ca_manager
        .generate_self_signed_ca(&req.name, validity_days)
        .await
    {
        Ok(ca) => ca,
        Err(e) => return trust_error(e),
    };
    if let Err(e) = ca_manager.save_ca(&mut ca, true).await {
        return trust_error(e);
    }

    (
        StatusCode::CREATED,
        Json(json!({
            "id": ca.id,
            "name": ca.name,
            "certificate_pem": ca.certificate_pem,
            "valid_from": ca.valid_from.to_rfc3339(),
            "valid_until": ca.valid_until.to_rfc3339(),
            "subject_dn": ca.subject_dn,
            "serial_number": ca.serial_number,
            "is_active": ca.is_active,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct GenerateCertificateRequest {
    server_id: String,
    validity_days: Option<i64>,
}

async fn generate_certificate(
    State(state): State<TrustState>,
    Json(req): Json<GenerateCertificateRequest>,
) -> Response {
    if req.server_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "server_id is required");
    }
    let validity_days = req.validity_days.unwrap_or(DEFAULT_CERT_VALIDITY_DAYS);

    match servers::server_exists(&state.pool, &req.server_id).await {
        Ok(true) => {}
        Ok(false) => return error_response(StatusCode::NOT_FOUND, "server not found"),
        Err(e) => {
            error!(error = %e, "failed to verify server existence");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to verify server existence",
            );
        }
    }

    let mut cert = match state
        .issuer
        .generate_client_certificate(&req.server_id, validity_days)
        .await
    {
        Ok(cert) => cert,
        Err(e) => return trust_error(e),
    };
    if let Err(e) = state.issuer.save(&mut cert).await {
        return trust_error(e);
    }

    // The agent needs the plaintext key and the CA chain exactly once, at
    // distribution time.
    let ca = match state.issuer.ca_manager().get_active_ca().await {
        Ok(ca) => ca,
        Err(e) => return trust_error(e),
    };
    let private_key_pem = match state.issuer.decrypt_private_key(&cert) {
        Ok(pem) => pem,
        Err(e) => return trust_error(e),
    };

    (
        StatusCode::CREATED,
        Json(json!({
            "id": cert.id,
            "server_id": cert.server_id,
            "serial_number": cert.serial_number,
            "certificate_pem": cert.certificate_pem,
            "private_key_pem": private_key_pem,
            "ca_certificate_pem": ca.certificate_pem,
            "valid_from": cert.valid_from.to_rfc3339(),
            "valid_until": cert.valid_until.to_rfc3339(),
            "fingerprint_sha256": cert.fingerprint_sha256,
        })),
    )
        .into_response()
}

async fn list_cas(State(state): State<TrustState>) -> Response {
    match state.issuer.ca_manager().list_cas().await {
        Ok(cas) => {
            let list: Vec<_> = cas
                .iter()
                .map(|ca| {
                    json!({
                        "id": ca.id,
                        "name": ca.name,
                        "subject_dn": ca.subject_dn,
                        "serial_number": ca.serial_number,
                        "valid_from": ca.valid_from.to_rfc3339(),
                        "valid_until": ca.valid_until.to_rfc3339(),
                        "is_active": ca.is_active,
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"certificate_authorities": list}))).into_response()
        }
        Err(e) => trust_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ActivateCaRequest {
    ca_id: i32,
}

async fn activate_ca(
    State(state): State<TrustState>,
    Json(req): Json<ActivateCaRequest>,
) -> Response {
    match state.issuer.ca_manager().set_active_ca(req.ca_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "active", "ca_id": req.ca_id})),
        )
            .into_response(),
        Err(e) => trust_error(e),
    }
}

async fn renew_certificate(
    State(state): State<TrustState>,
    Json(req): Json<GenerateCertificateRequest>,
) -> Response {
    if req.server_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "server_id is required");
    }
    let validity_days = req.validity_days.unwrap_or(DEFAULT_CERT_VALIDITY_DAYS);

    match state.issuer.renew(&req.server_id, validity_days).await {
        Ok(cert) => (
            StatusCode::OK,
            Json(json!({
                "id": cert.id,
                "server_id": cert.server_id,
                "serial_number": cert.serial_number,
                "certificate_pem": cert.certificate_pem,
                "valid_from": cert.valid_from.to_rfc3339(),
                "valid_until": cert.valid_until.to_rfc3339(),
                "fingerprint_sha256": cert.fingerprint_sha256,
                "status": cert.status,
            })),
        )
            .into_response(),
        Err(e) => trust_error(e),
    }
}

async fn certificate_history(
    State(state): State<TrustState>,
    Path(server_id): Path<String>,
) -> Response {
    match state.issuer.list(&server_id).await {
        Ok(certs) => {
            let list: Vec<_> = certs
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "serial_number": c.serial_number,
                        "status": c.status,
                        "valid_from": c.valid_from.to_rfc3339(),
                        "valid_until": c.valid_until.to_rfc3339(),
                        "revoked_at": c.revoked_at.map(|t| t.to_rfc3339()),
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({"server_id": server_id, "certificates": list})),
            )
                .into_response()
        }
        Err(e) => trust_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct RevokeCertificateRequest {
    certificate_id: i32,
    reason: Option<String>,
    revoked_by: Option<String>,
}

async fn revoke_certificate(
    State(state): State<TrustState>,
    Json(req): Json<RevokeCertificateRequest>,
) -> Response {
    let reason = req.reason.as_deref().unwrap_or("");

    match state
        .issuer
        .revoke(req.certificate_id, reason, req.revoked_by.as_deref())
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "revoked", "certificate_id": req.certificate_id})),
        )
            .into_response(),
        Err(e) => trust_error(e),
    }
}

async fn active_certificate(
    State(state): State<TrustState>,
    Path(server_id): Path<String>,
) -> Response {
    match state.issuer.get_active(&server_id).await {
        Ok(cert) => (
            StatusCode::OK,
            Json(json!({
                "id": cert.id,
                "server_id": cert.server_id,
                "serial_number": cert.serial_number,
                "certificate_pem": cert.certificate_pem,
                "valid_from": cert.valid_from.to_rfc3339(),
                "valid_until": cert.valid_until.to_rfc3339(),
                "fingerprint_sha256": cert.fingerprint_sha256,
                "status": cert.status,
            })),
        )
            .into_response(),
        Err(e) => trust_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ExpiringQuery {
    days: Option<i64>,
}

async fn expiring_certificates(
    State(state): State<TrustState>,
    Query(query): Query<ExpiringQuery>,
) -> Response {
    let days = query.days.unwrap_or(30);
    let now = Utc::now();

    match state.issuer.get_expiring(days).await {
        Ok(certs) => {
            let list: Vec<_> = certs
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "server_id": c.server_id,
                        "serial_number": c.serial_number,
                        "valid_until": c.valid_until.to_rfc3339(),
                        "days_remaining": c.days_remaining(now),
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"certificates": list, "days": days}))).into_response()
        }
        Err(e) => trust_error(e),
    }
}

/// Translate trust errors to HTTP exactly once.
fn trust_error(e: TrustError) -> Response {
    let (status, message) = match &e {
        TrustError::CertificateNotFound | TrustError::CaNotFound => {
            (StatusCode::NOT_FOUND, e.to_string())
        }
        TrustError::NoActiveCa => (StatusCode::NOT_FOUND, e.to_string()),
        TrustError::AlreadyRevoked => (StatusCode::CONFLICT, e.to_string()),
        TrustError::Revoked | TrustError::Expired | TrustError::NotYetValid => {
            (StatusCode::UNAUTHORIZED, e.to_string())
        }
        TrustError::Storage(_) | TrustError::Crypto(_) | TrustError::Generation(_) => {
            error!(error = %e, "trust operation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    };
    error_response(status, &message)
}
