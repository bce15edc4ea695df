use std::sync::Arc;

use busline::bus::Bus;
use busline::config::load_config;
use busline::diagnostics::TracingDiagnostics;
use busline::utils::{BusError, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        error!("{e}");
        eprintln!("busline: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BusError> {
    let settings = load_config()?;
    logging::init(&settings.logging.level);
    info!(base_uri = %settings.server.base_uri, storage = %settings.storage.path, "Starting busline");

    let bus = Bus::start(&settings, Vec::new(), Arc::new(TracingDiagnostics)).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down");
    bus.shutdown().await;
    Ok(())
}
