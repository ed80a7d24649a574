//! Bootstrap utilities shared by all armada binaries.

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing from the `LOG_LEVEL` environment variable.
///
/// Falls back to "debug" when `DEBUG` is set truthy, else "info".
pub fn init_tracing() {
    let fallback = match std::env::var("DEBUG").as_deref() {
        Ok("true") | Ok("1") => "debug",
        _ => "info",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Root shutdown token, cancelled on SIGINT or SIGTERM.
///
/// Every worker loop observes this token; HTTP servers use it for graceful
/// shutdown. The signal listener task lives for the rest of the process.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt, shutting down");
        }

        signal_token.cancel();
    });

    token
}

/// Consumer name for horizontal scaling: `<prefix>-<hostname>`.
///
/// Falls back to random hex when no hostname is available, so two consumers
/// never collide inside one consumer group.
pub fn consumer_name(prefix: &str) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| {
            use rand::RngCore;
            let mut b = [0u8; 4];
            rand::rngs::OsRng.fill_bytes(&mut b);
            hex::encode(b)
        });
    format!("{prefix}-{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_name_has_prefix() {
        let name = consumer_name("digest");
        assert!(name.starts_with("digest-"));
        assert!(name.len() > "digest-".len());
    }
}
