//! Shell proxy: WebSocket to SSH bridge.
//!
//! Upgrades `GET /ssh/:server_id`, authenticates against the host's bound
//! SSH key (or a session-only password, never persisted), opens a
//! PTY-backed shell, and pipes bytes both ways. Host keys are pinned trust
//! on first use; every session writes an audit record, including sessions
//! that never get past the dial.
//!
//! Wire protocol, JSON envelopes:
//! client → server `{type: auth|input|resize|ping, ...}`;
//! server → client `{type: connected|auth_success|output|error|disconnected|pong, ...}`.

pub mod hostkey;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use russh::client;
use russh::ChannelMsg;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::crypto::{self, CryptoError};
use crate::storage::sessions::{self, SessionStart};
use crate::storage::{servers, StorageError};
use hostkey::TofuVerifier;

/// SSH handshake deadline.
const SSH_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_COLS: u32 = 80;
const DEFAULT_ROWS: u32 = 24;

/// Shell proxy failures.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("ssh key error: {0}")]
    Key(#[from] russh_keys::Error),

    #[error("SSH host not configured for this server")]
    NoHost,

    #[error("no authentication method available (need private key or password)")]
    NoAuthMethod,

    #[error("SSH authentication failed")]
    AuthFailed,

    #[error("SSH handshake timed out")]
    HandshakeTimeout,

    #[error("host key verification failed: fingerprint mismatch (possible MITM or server rebuild): expected {expected}, got {presented}")]
    HostKeyMismatch { expected: String, presented: String },
}

/// Client-to-server message envelope.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    data: String,
    password: String,
    cols: u32,
    rows: u32,
}

#[derive(Clone)]
pub struct ShellState {
    pub pool: PgPool,
    pub master_key: String,
}

pub fn router(state: ShellState) -> Router {
    Router::new()
        .route("/ssh/:server_id", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<ShellState>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let server_id = match Uuid::parse_str(&server_id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "server_id must be a UUID"})),
            )
                .into_response();
        }
    };

    let client_meta = ClientMeta::from_headers(&headers);
    ws.on_upgrade(move |socket| handle_socket(state, server_id, client_meta, socket))
}

/// Per-connection client metadata for the audit record.
#[derive(Debug, Clone, Default)]
struct ClientMeta {
    ip_address: Option<String>,
    user_agent: Option<String>,
}

impl ClientMeta {
    fn from_headers(headers: &HeaderMap) -> Self {
        let first_forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string());
        let user_agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Self {
            ip_address: first_forwarded,
            user_agent,
        }
    }
}

async fn handle_socket(
    state: ShellState,
    server_id: Uuid,
    client_meta: ClientMeta,
    mut socket: WebSocket,
) {
    let session_id = format!(
        "ssh_{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    info!(session_id = %session_id, server_id = %server_id, "shell session connected");

    let greeting = json!({
        "type": "connected",
        "sessionId": session_id,
        "message": "connected; send auth message to begin SSH session",
    });
    if send_json(&mut socket, &greeting).await.is_err() {
        return;
    }

    // Wait for the auth envelope; answer pings meanwhile.
    while let Some(Ok(message)) = socket.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
            warn!(session_id = %session_id, "unparsable client message");
            continue;
        };

        match parsed.kind.as_str() {
            "auth" => {
                run_session(&state, server_id, &session_id, &client_meta, parsed, socket).await;
                return;
            }
            "ping" => {
                if send_json(&mut socket, &json!({"type": "pong"})).await.is_err() {
                    return;
                }
            }
            other => warn!(session_id = %session_id, kind = %other, "unknown message type"),
        }
    }

    info!(session_id = %session_id, "shell session closed before auth");
}

/// Authenticate, dial, and pump one shell session.
async fn run_session(
    state: &ShellState,
    server_id: Uuid,
    session_id: &str,
    client_meta: &ClientMeta,
    auth: ClientMessage,
    mut socket: WebSocket,
) {
    match establish(state, server_id, session_id, client_meta, &auth, &mut socket).await {
        Ok(established) => {
            let outcome = pump(established, socket).await;
            if let Err(e) =
                sessions::log_session_end(&state.pool, session_id, "closed", &outcome).await
            {
                warn!(session_id = %session_id, error = %e, "failed to close session audit row");
            }
            info!(session_id = %session_id, reason = %outcome, "shell session ended");
        }
        Err(e) => {
            let _ = send_json(
                &mut socket,
                &json!({"type": "error", "message": e.to_string()}),
            )
            .await;
            if let Err(audit_err) =
                sessions::log_session_end(&state.pool, session_id, "failed", &e.to_string()).await
            {
                warn!(session_id = %session_id, error = %audit_err, "failed to close session audit row");
            }
            error!(session_id = %session_id, error = %e, "shell session failed");
        }
    }
}

/// A dialled, authenticated shell with its channel.
struct Established {
    handle: client::Handle<TofuVerifier>,
    channel: russh::Channel<client::Msg>,
}

async fn establish(
    state: &ShellState,
    server_id: Uuid,
    session_id: &str,
    client_meta: &ClientMeta,
    auth: &ClientMessage,
    socket: &mut WebSocket,
) -> Result<Established, ShellError> {
    let target = servers::fetch_shell_target(&state.pool, server_id).await?;
    if target.ssh_host.is_empty() {
        // Audit even the sessions that never dial.
        audit_start(state, server_id, session_id, client_meta, &target, "none").await;
        return Err(ShellError::NoHost);
    }

    // Key auth when a primary key is bound; else a session-only password.
    enum AuthMethod {
        Key(russh_keys::key::KeyPair),
        Password(String),
    }

    let (method, method_name) = match &target.encrypted_key {
        Some(encrypted) if !encrypted.is_empty() => {
            let pem = crypto::decrypt_auto(encrypted, &state.master_key)?;
            let key = russh_keys::decode_secret_key(&pem, None)?;
            (AuthMethod::Key(key), "key")
        }
        _ if !auth.password.is_empty() => {
            (AuthMethod::Password(auth.password.clone()), "password")
        }
        _ => {
            audit_start(state, server_id, session_id, client_meta, &target, "none").await;
            return Err(ShellError::NoAuthMethod);
        }
    };

    audit_start(state, server_id, session_id, client_meta, &target, method_name).await;

    let verifier = TofuVerifier::new(state.pool.clone(), server_id);
    let observed = verifier.observed.clone();

    let config = Arc::new(client::Config::default());
    let address = (target.ssh_host.as_str(), target.ssh_port as u16);
    info!(session_id = %session_id, host = %target.ssh_host, port = target.ssh_port, "dialling SSH");

    let mut handle = tokio::time::timeout(SSH_TIMEOUT, client::connect(config, address, verifier))
        .await
        .map_err(|_| ShellError::HandshakeTimeout)??;

    let observed_fingerprint = observed.lock().expect("fingerprint lock").clone();
    if let Some(fingerprint) = observed_fingerprint {
        sessions::record_fingerprint(&state.pool, session_id, &fingerprint).await;
    }

    let authenticated = match method {
        AuthMethod::Key(key) => {
            handle
                .authenticate_publickey(target.ssh_username.as_str(), Arc::new(key))
                .await?
        }
        AuthMethod::Password(password) => {
            handle
                .authenticate_password(target.ssh_username.as_str(), password.as_str())
                .await?
        }
    };
    if !authenticated {
        return Err(ShellError::AuthFailed);
    }

    let mut channel = handle.channel_open_session().await?;

    let cols = if auth.cols == 0 { DEFAULT_COLS } else { auth.cols };
    let rows = if auth.rows == 0 { DEFAULT_ROWS } else { auth.rows };
    channel
        .request_pty(true, "xterm-256color", cols, rows, 0, 0, &[])
        .await?;
    channel.request_shell(true).await?;

    let _ = send_json(
        socket,
        &json!({"type": "auth_success", "message": "SSH connection established"}),
    )
    .await;

    info!(session_id = %session_id, "SSH session established");
    Ok(Established { handle, channel })
}

async fn audit_start(
    state: &ShellState,
    server_id: Uuid,
    session_id: &str,
    client_meta: &ClientMeta,
    target: &servers::ShellTarget,
    auth_method: &str,
) {
    let start = SessionStart {
        session_id: session_id.to_string(),
        server_id,
        operator: None,
        ip_address: client_meta.ip_address.clone(),
        user_agent: client_meta.user_agent.clone(),
        auth_method: auth_method.to_string(),
        ssh_username: target.ssh_username.clone(),
        ssh_host: target.ssh_host.clone(),
        ssh_port: target.ssh_port,
        host_key_fingerprint: None,
    };

    if let Err(e) = sessions::log_session_start(&state.pool, &start).await {
        warn!(session_id = %session_id, error = %e, "failed to write session audit row");
    }
}

/// Bidirectional pump. Returns the disconnect reason.
///
/// Bytes within each direction keep arrival order; stdout and stderr both
/// map to `output` with no cross-stream ordering guarantee.
async fn pump(established: Established, socket: WebSocket) -> String {
    let Established {
        handle,
        mut channel,
    } = established;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let reason = loop {
        tokio::select! {
            ws_msg = ws_rx.next() => {
                let Some(Ok(message)) = ws_msg else {
                    break "client disconnected".to_string();
                };
                let Message::Text(text) = message else {
                    if matches!(message, Message::Close(_)) {
                        break "client closed".to_string();
                    }
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
                    continue;
                };

                match parsed.kind.as_str() {
                    "input" => {
                        if !parsed.data.is_empty() {
                            if channel.data(parsed.data.as_bytes()).await.is_err() {
                                break "remote stdin closed".to_string();
                            }
                        }
                    }
                    "resize" => {
                        let cols = if parsed.cols == 0 { DEFAULT_COLS } else { parsed.cols };
                        let rows = if parsed.rows == 0 { DEFAULT_ROWS } else { parsed.rows };
                        let _ = channel.window_change(cols, rows, 0, 0).await;
                    }
                    "ping" => {
                        let pong = serde_json::to_string(&json!({"type": "pong"})).expect("static json");
                        if ws_tx.send(Message::Text(pong)).await.is_err() {
                            break "client disconnected".to_string();
                        }
                    }
                    _ => {}
                }
            }
            ch_msg = channel.wait() => {
                match ch_msg {
                    Some(ChannelMsg::Data { ref data }) | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                        let output = json!({
                            "type": "output",
                            "data": String::from_utf8_lossy(data).into_owned(),
                        });
                        let text = serde_json::to_string(&output).expect("output json");
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break "client disconnected".to_string();
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!(exit_status, "remote shell exited");
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        break "remote shell closed".to_string();
                    }
                    Some(_) => {}
                }
            }
        }
    };

    let disconnected =
        serde_json::to_string(&json!({"type": "disconnected", "message": "SSH connection closed"}))
            .expect("static json");
    let _ = ws_tx.send(Message::Text(disconnected)).await;

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;

    reason
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).expect("serializable json");
    socket.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_tolerate_missing_fields() {
        let auth: ClientMessage = serde_json::from_str(r#"{"type":"auth"}"#).unwrap();
        assert_eq!(auth.kind, "auth");
        assert!(auth.password.is_empty());
        assert_eq!(auth.cols, 0);

        let resize: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(resize.cols, 120);
        assert_eq!(resize.rows, 40);
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.7, 10.0.0.1".parse().unwrap(),
        );
        headers.insert("user-agent", "xterm-web/1.0".parse().unwrap());

        let meta = ClientMeta::from_headers(&headers);
        assert_eq!(meta.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(meta.user_agent.as_deref(), Some("xterm-web/1.0"));
    }
}
