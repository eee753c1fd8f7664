//! Signal handling for graceful shutdown

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::service::{ServiceHandles, ServiceState};

/// Resolves once on Ctrl+C or SIGTERM
pub fn setup_signal_handlers() -> Result<mpsc::Receiver<()>> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C signal: {}", e);
            return;
        }

        info!("Ctrl+C signal received");
        let _ = ctrl_c_tx.try_send(());
    });

    #[cfg(unix)]
    {
        use signal_hook::consts::SIGTERM;

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, shutdown_flag.clone())?;

        tokio::spawn(async move {
            while !shutdown_flag.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("SIGTERM signal received");
            let _ = shutdown_tx.try_send(());
        });
    }

    Ok(shutdown_rx)
}

/// Stop every component, waiting up to the configured timeout for each
pub async fn graceful_shutdown(service_state: Arc<ServiceState>, handles: ServiceHandles) -> Result<()> {
    info!("Starting graceful shutdown...");
    service_state.request_shutdown();

    let shutdown_timeout = Duration::from_secs(service_state.config.service.shutdown_timeout_secs);

    wait_for("Tick scheduler", handles.scheduler, shutdown_timeout).await;
    wait_for("PriceGateway", handles.gateway, shutdown_timeout).await;
    if let Some(rest) = handles.rest {
        wait_for("REST API", rest, shutdown_timeout).await;
    }

    // the engine keeps the batch queue open, so the broadcaster never drains on its own
    handles.broadcaster.abort();

    info!("Graceful shutdown complete");
    Ok(())
}

async fn wait_for(name: &str, handle: JoinHandle<()>, limit: Duration) {
    match timeout(limit, handle).await {
        Ok(Ok(())) => info!("{} stopped gracefully", name),
        Ok(Err(e)) => error!("{} task failed: {}", name, e),
        Err(_) => warn!("{} did not stop within timeout, forcing shutdown", name),
    }
}
