//! Edge authentication from forwarded client-certificate headers.
//!
//! The TLS handshake itself terminates at the reverse proxy; on a verified
//! handshake the proxy injects the client certificate's metadata as request
//! headers. This middleware re-validates that metadata against the
//! certificate store and binds the authenticated `server_id` onto the
//! request. It composes with the server-id validator: both must pass.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::trust::{CertIssuer, TrustError};

pub const HEADER_SERIAL: &str = "x-client-cert-serial";
pub const HEADER_SUBJECT: &str = "x-client-cert-subject";
pub const HEADER_CN: &str = "x-client-cert-cn";
pub const HEADER_FINGERPRINT: &str = "x-client-cert-fingerprint";

/// Client certificate metadata extracted from proxy headers.
#[derive(Debug, Clone)]
pub struct ClientCertInfo {
    pub serial_number: String,
    pub subject: String,
    pub common_name: String,
    pub fingerprint: String,
}

/// The `server_id` bound to a request after successful authentication.
#[derive(Debug, Clone)]
pub struct AuthenticatedServer(pub String);

/// Header extraction failures.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("missing X-Client-Cert-Serial header")]
    MissingSerial,

    #[error("missing X-Client-Cert-CN header")]
    MissingCommonName,
}

/// Pull certificate metadata out of the proxy headers.
///
/// Serial and CN are mandatory; subject and fingerprint are informational.
pub fn extract_client_cert(headers: &HeaderMap) -> Result<ClientCertInfo, HeaderError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let serial_number = header(HEADER_SERIAL).ok_or(HeaderError::MissingSerial)?;
    let common_name = header(HEADER_CN).ok_or(HeaderError::MissingCommonName)?;

    Ok(ClientCertInfo {
        serial_number,
        subject: header(HEADER_SUBJECT).unwrap_or_default(),
        common_name,
        fingerprint: header(HEADER_FINGERPRINT).unwrap_or_default(),
    })
}

/// Axum middleware enforcing mutual-TLS authentication.
///
/// Rejects with 401 when headers are missing, the certificate is unknown,
/// its status is revoked or expired, or the CN does not match the stored
/// `server_id` (defence against a CN/serial mismatch).
pub async fn mtls_auth(
    State(issuer): State<CertIssuer>,
    mut request: Request,
    next: Next,
) -> Response {
    let info = match extract_client_cert(request.headers()) {
        Ok(info) => info,
        Err(e) => return unauthorized("client certificate required", &e.to_string()),
    };

    let cert = match issuer.get_by_serial(&info.serial_number).await {
        Ok(cert) => cert,
        Err(TrustError::CertificateNotFound) => {
            warn!(serial = %info.serial_number, "rejected unknown client certificate");
            return unauthorized("invalid client certificate", "certificate not found");
        }
        Err(e) => {
            warn!(error = %e, "certificate lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "certificate validation failed"})),
            )
                .into_response();
        }
    };

    if cert.status != crate::trust::STATUS_ACTIVE {
        warn!(serial = %info.serial_number, status = %cert.status, "rejected inactive certificate");
        return unauthorized(
            "invalid client certificate",
            &format!("certificate is {}", cert.status),
        );
    }

    if cert.server_id != info.common_name {
        warn!(
            serial = %info.serial_number,
            cn = %info.common_name,
            "certificate CN does not match stored server_id"
        );
        return unauthorized(
            "invalid client certificate",
            "certificate CN does not match server_id",
        );
    }

    request
        .extensions_mut()
        .insert(AuthenticatedServer(cert.server_id.clone()));
    request.extensions_mut().insert(info);

    next.run(request).await
}

fn unauthorized(error: &str, detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": error, "detail": detail})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn extracts_and_trims_all_headers() {
        let map = headers(&[
            (HEADER_SERIAL, " abc123 "),
            (HEADER_CN, "00000000-0000-0000-0000-000000000001"),
            (HEADER_SUBJECT, "CN=00000000-0000-0000-0000-000000000001"),
            (HEADER_FINGERPRINT, "deadbeef"),
        ]);

        let info = extract_client_cert(&map).unwrap();
        assert_eq!(info.serial_number, "abc123");
        assert_eq!(info.common_name, "00000000-0000-0000-0000-000000000001");
        assert_eq!(info.fingerprint, "deadbeef");
    }

    #[test]
    fn serial_and_cn_are_mandatory() {
        let no_serial = headers(&[(HEADER_CN, "host")]);
        assert!(matches!(
            extract_client_cert(&no_serial),
            Err(HeaderError::MissingSerial)
        ));

        let no_cn = headers(&[(HEADER_SERIAL, "abc")]);
        assert!(matches!(
            extract_client_cert(&no_cn),
            Err(HeaderError::MissingCommonName)
        ));

        // Blank values count as missing.
        let blank = headers(&[(HEADER_SERIAL, "  "), (HEADER_CN, "host")]);
        assert!(extract_client_cert(&blank).is_err());
    }
}
