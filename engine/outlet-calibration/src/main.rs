use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use outlet_calibration::cli::{Cli, Command};
use outlet_calibration::{CalibrationConfig, CalibrationScheduler, Calibrator, PgCalibrationStore};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(env_filter).with(fmt::layer().with_target(false)).init();

    let cli = Cli::parse();

    let mut config = CalibrationConfig::from_env().context("Failed to load calibration configuration")?;
    cli.apply_overrides(&mut config.params);
    config.validate().context("Invalid calibration parameters")?;

    let store = Arc::new(
        PgCalibrationStore::connect(&config.database)
            .await
            .context("Failed to connect to the database")?,
    );
    let calibrator = Calibrator::new(config.params);

    match cli.command {
        Command::Run { dry_run, .. } => {
            let report = calibrator
                .run(store.as_ref(), store.as_ref(), Utc::now(), dry_run)
                .await
                .context("Calibration run failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Schedule => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for shutdown signal: {}", e);
                    return;
                }
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            });

            let scheduler = CalibrationScheduler::new(
                calibrator,
                store.clone(),
                store,
                config.schedule.weekday()?,
                config.schedule.time_of_day()?,
            );
            scheduler.run(shutdown_rx).await;
        }
    }

    Ok(())
}
