//! armada-ingest: public telemetry ingest edge plus the internal trust API.
//!
//! Agents POST snapshot bundles to `/metrics/prometheus`; the edge
//! validates the sender and publishes each snapshot onto the metrics
//! stream. Nothing on the ingest path touches the database directly.
//! The internal trust API (`/internal/...`) serves the operator surface.

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use armada::handlers::certificates::TrustState;
use armada::handlers::ingest::IngestState;
use armada::trust::CertIssuer;
use armada::utils::bootstrap::{init_tracing, shutdown_token};
use armada::validation::{ServerIdValidator, DEFAULT_CACHE_TTL};
use armada::{broker, handlers, storage, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = Config::load()?;

    // Certificate operations need the master key; missing key is fatal.
    let master_key = config.load_master_key().map_err(|e| {
        error!(error = %e, "cannot start without master key");
        e
    })?;

    let pool = storage::connect(&config.database_url()).await?;
    let broker = broker::Broker::connect(&config.broker_url()).await?;

    let validator = ServerIdValidator::new(pool.clone(), broker.clone(), DEFAULT_CACHE_TTL);
    let issuer = CertIssuer::new(pool.clone(), master_key);

    let mtls = config.mtls_enabled.then(|| issuer.clone());
    if config.mtls_enabled {
        info!("mTLS header enforcement enabled on the ingest path");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(|| handlers::service_health("armada-ingest")))
        .merge(handlers::ingest::router(
            IngestState {
                broker: broker.clone(),
                validator,
            },
            mtls,
        ))
        .merge(handlers::certificates::router(TrustState {
            pool: pool.clone(),
            issuer,
        }))
        .layer(cors);

    let token = shutdown_token();
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "ingest service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    pool.close().await;
    info!("ingest service stopped");
    Ok(())
}
