//! tally-sweeper: redemption expiry sweeper daemon.
//!
//! Periodically cancels PENDING/IN_PROGRESS redemptions whose deadline has
//! passed. Deploy as a long-running service or let a scheduler run it next
//! to the API instances; sweeps are idempotent either way.
//!
//! ## Configuration
//! - TALLY_CONFIG: path to a config.yaml (optional)
//! - TALLY__STORAGE__PATH: database path override
//! - TALLY__SWEEPER__INTERVAL_SECS: seconds between passes
//! - TALLY_LOG: tracing filter (default "info")

use std::sync::Arc;

use tracing::{error, info};

use tally::config::Config;
use tally::redemption::RedemptionEngine;
use tally::storage::init_storage;
use tally::sweeper::ExpirySweeper;
use tally::utils::{bootstrap, SystemClock};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting tally-sweeper");

    let stores = init_storage(&config.storage).await?;

    let engine = Arc::new(RedemptionEngine::new(
        stores.redemptions,
        stores.ledger,
        stores.catalog,
        Arc::new(SystemClock),
        config.redemption.clone(),
    ));

    let sweeper = ExpirySweeper::new(engine, config.sweeper.interval());

    tokio::select! {
        _ = sweeper.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
