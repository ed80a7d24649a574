//! armada-deployer: runs configuration-management jobs from the
//! deployments stream, one at a time.

use tracing::{error, info};

use armada::deploy::DeployWorker;
use armada::utils::bootstrap::{consumer_name, init_tracing, shutdown_token};
use armada::{broker, storage, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    info!("starting deployment worker");

    let config = Config::load()?;

    // SSH private keys for the inventory decrypt under the master key.
    let master_key = config.load_master_key().map_err(|e| {
        error!(error = %e, "cannot start without master key");
        e
    })?;

    let pool = storage::connect(&config.database_url()).await?;
    let broker = broker::Broker::connect(&config.broker_url()).await?;

    let token = shutdown_token();
    armada::handlers::spawn_health_server("armada-deployer", config.port, token.clone());

    let worker = DeployWorker::new(
        pool.clone(),
        broker,
        master_key,
        consumer_name("deployer"),
    );
    worker.run(token).await;

    pool.close().await;
    info!("deployment worker stopped");
    Ok(())
}
