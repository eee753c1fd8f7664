//! Pricing Service
//!
//! Entry point of the pricing process: loads configuration, builds the
//! engine and gateway, runs until Ctrl+C or SIGTERM and shuts down cleanly.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use pricing_service::{
    graceful_shutdown, initialize_logging, load_configuration, setup_signal_handlers, ServiceState,
};

#[derive(Parser)]
#[command(name = "pricing-service")]
#[command(about = "Dynamic pricing engine with live price feed")]
struct Args {
    /// Gateway TOML configuration file
    #[arg(long)]
    gateway_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = load_configuration(args.gateway_config.as_deref())?;
    initialize_logging(&config.logging).context("Failed to initialize logging")?;

    info!("Starting Pricing Service v{}", env!("CARGO_PKG_VERSION"));

    let service_state = Arc::new(ServiceState::new(config).await?);
    service_state.install_metrics_exporter()?;
    info!("Service state initialized");

    let mut shutdown_signal = setup_signal_handlers()?;
    let handles = service_state.start().await?;

    info!("Pricing Service is running. Press Ctrl+C to shutdown gracefully.");
    let _ = shutdown_signal.recv().await;

    info!("Shutdown signal received. Initiating graceful shutdown...");
    graceful_shutdown(service_state, handles).await?;

    info!("Pricing Service shutdown complete");
    Ok(())
}
