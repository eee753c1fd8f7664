use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::engine::PricingEngine;

/// Drives `PricingEngine::run_tick` at the cadence of the stored engine config.
///
/// Each tick runs in its own task holding the in-flight guard. A deadline that
/// arrives while the guard is held is skipped, never queued.
pub struct TickScheduler {
    engine: Arc<PricingEngine>,
    in_flight: Arc<Mutex<()>>,
}

impl TickScheduler {
    pub fn new(engine: Arc<PricingEngine>) -> Self {
        Self { engine, in_flight: Arc::new(Mutex::new(())) }
    }

    /// Run until `shutdown` flips to true. The cadence is re-read after every
    /// trigger so interval changes apply from the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting pricing tick scheduler");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            self.trigger();

            let interval = self.engine.current_engine_config().await.tick_interval();
            let deadline = started + interval;

            tokio::select! {
                _ = sleep_until(deadline) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // let a running tick finish its commits before returning
        let _guard = self.in_flight.lock().await;
        info!("Pricing tick scheduler stopped");
    }

    /// Start a tick unless one is still running. Returns the tick task, or
    /// `None` when the tick was skipped.
    pub fn trigger(&self) -> Option<JoinHandle<()>> {
        let guard = match self.in_flight.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Previous pricing tick still running, skipping this tick");
                self.engine.metrics_collector().record_skipped_tick();
                return None;
            }
        };

        let engine = self.engine.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            match engine.run_tick().await {
                Ok(report) => info!(
                    "Tick {} complete: {} processed, {} updated, {} unchanged, {} failed in {:?}",
                    report.tick_seq,
                    report.processed,
                    report.updated,
                    report.unchanged,
                    report.failed,
                    report.duration
                ),
                Err(e) => error!("Pricing tick failed: {}", e),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingConfig;
    use crate::memory::MemoryStore;
    use crate::store::PricingStores;
    use std::time::Duration;

    fn engine() -> Arc<PricingEngine> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(PricingEngine::new(PricingConfig::default(), PricingStores::shared(store)))
    }

    #[tokio::test]
    async fn test_trigger_runs_tick() {
        let engine = engine();
        let scheduler = TickScheduler::new(engine.clone());

        let handle = scheduler.trigger().unwrap();
        handle.await.unwrap();
        assert_eq!(engine.metrics().total_ticks, 1);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let engine = engine();
        let scheduler = TickScheduler::new(engine.clone());

        let held = scheduler.in_flight.clone().try_lock_owned().unwrap();
        assert!(scheduler.trigger().is_none());
        assert_eq!(engine.metrics().skipped_ticks, 1);
        assert_eq!(engine.metrics().total_ticks, 0);

        drop(held);
        scheduler.trigger().unwrap().await.unwrap();
        assert_eq!(engine.metrics().total_ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let engine = engine();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(TickScheduler::new(engine.clone()).run(rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // ticks at 0s, 60s and 120s with the default cadence
        assert_eq!(engine.metrics().total_ticks, 3);
    }
}
