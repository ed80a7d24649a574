//! armada-shellws: WebSocket shell proxy.
//!
//! Bridges browser WebSocket sessions at `/ssh/:server_id` to PTY-backed
//! SSH shells on managed hosts, with TOFU host-key pinning and session
//! audit.

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use armada::shellws::{self, ShellState};
use armada::utils::bootstrap::{init_tracing, shutdown_token};
use armada::{handlers, storage, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load()?;

    // Bound SSH keys decrypt under the master key.
    let master_key = config.load_master_key().map_err(|e| {
        error!(error = %e, "cannot start without master key");
        e
    })?;

    let pool = storage::connect(&config.database_url()).await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(|| handlers::service_health("armada-shellws")))
        .merge(shellws::router(ShellState {
            pool: pool.clone(),
            master_key,
        }))
        .layer(cors);

    let token = shutdown_token();
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "shell proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    pool.close().await;
    info!("shell proxy stopped");
    Ok(())
}
