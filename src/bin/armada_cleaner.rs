//! armada-cleaner: one-shot retention sweep.
//!
//! Deletes telemetry rows past the retention horizon and exits. Set
//! `DRY_RUN=true` to log what would be deleted without touching anything.

use tracing::info;

use armada::cleaner::{run_sweep, Cleaner};
use armada::utils::bootstrap::{init_tracing, shutdown_token};
use armada::{storage, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load()?;
    if config.dry_run {
        info!("dry run: no rows will be deleted");
    }

    let pool = storage::connect(&config.database_url()).await?;
    let token = shutdown_token();

    let cleaner = Cleaner::new(pool.clone(), config.dry_run);
    run_sweep(&cleaner, &token).await;

    pool.close().await;
    Ok(())
}
