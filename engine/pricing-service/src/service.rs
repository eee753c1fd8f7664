//! Service state management and component initialization

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use price_gateway::rest_api::create_routes;
use price_gateway::PriceGateway;
use pricing_engine::{AdminService, PgPricingStore, PriceBatch, PricingEngine, PricingStores, TickScheduler};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ServiceConfig;

/// Service state containing all initialized components
pub struct ServiceState {
    /// Service configuration
    pub config: ServiceConfig,

    pub engine: Arc<PricingEngine>,

    pub admin: Arc<AdminService>,

    pub gateway: Arc<PriceGateway>,

    /// Engine-to-broadcaster queue, taken when the broadcaster starts
    batches: Mutex<Option<mpsc::Receiver<PriceBatch>>>,

    shutdown: watch::Sender<bool>,
}

/// Handles of the running components
pub struct ServiceHandles {
    pub scheduler: JoinHandle<()>,
    pub gateway: JoinHandle<()>,
    pub broadcaster: JoinHandle<()>,
    pub rest: Option<JoinHandle<()>>,
}

impl ServiceState {
    /// Connect to the database and build every component
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        info!("Initializing service components...");

        let store = PgPricingStore::connect(&config.pricing.database)
            .await
            .context("Failed to connect to the pricing database")?;

        if config.service.run_migrations {
            info!("Applying database migrations...");
            store.migrate().await.context("Failed to apply migrations")?;
        }

        let stores = PricingStores::shared(Arc::new(store));
        Self::with_stores(config, stores).await
    }

    /// Build the components on top of existing stores
    pub async fn with_stores(config: ServiceConfig, stores: PricingStores) -> Result<Self> {
        if stores.engine_config.load_engine_config().await?.is_none() {
            info!("No engine config stored, seeding defaults");
            stores.engine_config.save_engine_config(&config.pricing.engine).await?;
        }

        let (batch_tx, batch_rx) = mpsc::channel(config.pricing.broadcast_queue_capacity);

        info!("Initializing PricingEngine...");
        let engine = Arc::new(PricingEngine::new(config.pricing.clone(), stores.clone()).with_event_sink(batch_tx));

        let admin = Arc::new(AdminService::new(
            stores.variables.clone(),
            stores.engine_config.clone(),
            config.pricing.engine,
        ));

        info!("Initializing PriceGateway...");
        let gateway = Arc::new(PriceGateway::new(config.gateway.clone(), engine.clone()));

        let (shutdown, _) = watch::channel(false);

        Ok(Self { config, engine, admin, gateway, batches: Mutex::new(Some(batch_rx)), shutdown })
    }

    /// Install the Prometheus exporter when metrics are enabled
    pub fn install_metrics_exporter(&self) -> Result<()> {
        if !self.config.metrics.enabled {
            return Ok(());
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.metrics.port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics listening on http://{}/metrics", addr);
        Ok(())
    }

    /// Start the broadcaster, tick scheduler, WebSocket gateway and REST API
    pub async fn start(&self) -> Result<ServiceHandles> {
        let batches = self
            .batches
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("Service components were already started"))?;

        let broadcaster = self.gateway.spawn_broadcaster(batches);

        info!("Starting tick scheduler...");
        let scheduler = tokio::spawn(TickScheduler::new(self.engine.clone()).run(self.shutdown.subscribe()));

        info!("Starting PriceGateway...");
        let gateway = {
            let gateway = self.gateway.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = gateway.start(shutdown).await {
                    error!("PriceGateway failed: {}", e);
                }
            })
        };

        let rest = if self.config.gateway.rest.enabled {
            Some(self.start_rest_api()?)
        } else {
            None
        };

        Ok(ServiceHandles { scheduler, gateway, broadcaster, rest })
    }

    fn start_rest_api(&self) -> Result<JoinHandle<()>> {
        let addr = self.config.gateway.rest_addr().context("Invalid REST address")?;
        let routes = create_routes(self.engine.clone(), self.admin.clone());

        let mut shutdown = self.shutdown.subscribe();
        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .context("Failed to bind REST API")?;

        info!("REST API listening on http://{}", bound);
        Ok(tokio::spawn(server))
    }

    /// Signal every component to stop
    pub fn request_shutdown(&self) {
        info!("Shutdown signal sent to all components");
        let _ = self.shutdown.send(true);
    }
}
