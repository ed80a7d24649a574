//! armada-digest: drains the metrics stream into the database.
//!
//! Runs the digest consumer loop and, on a one-minute ticker, the embedded
//! retention cleaner (plus one sweep at startup).

use tracing::info;

use armada::cleaner::{run_sweep, Cleaner, TICK_INTERVAL};
use armada::digest::DigestWorker;
use armada::utils::bootstrap::{consumer_name, init_tracing, shutdown_token};
use armada::{broker, storage, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    info!("starting digest worker");

    let config = Config::load()?;
    let pool = storage::connect(&config.database_url()).await?;
    let broker = broker::Broker::connect(&config.broker_url()).await?;

    let token = shutdown_token();
    armada::handlers::spawn_health_server("armada-digest", config.port, token.clone());

    // Retention runs inside this process so a minimal deployment needs no
    // separate cleaner.
    let cleaner = Cleaner::new(pool.clone(), config.dry_run);
    let cleaner_token = token.clone();
    let cleaner_task = tokio::spawn(async move {
        run_sweep(&cleaner, &cleaner_token).await;

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = cleaner_token.cancelled() => break,
                _ = tick.tick() => run_sweep(&cleaner, &cleaner_token).await,
            }
        }
    });

    let worker = DigestWorker::new(pool.clone(), broker, consumer_name("digest"));
    worker.run(token).await;

    cleaner_task.abort();
    pool.close().await;
    info!("digest worker stopped");
    Ok(())
}
