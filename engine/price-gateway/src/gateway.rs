//! Main PriceGateway implementation

use pricing_engine::{PriceBatch, PriceQuery};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broadcaster::PriceBroadcaster;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::websocket_handler::WebSocketHandler;

/// WebSocket front door of the price feed
pub struct PriceGateway {
    config: GatewayConfig,

    broadcaster: Arc<PriceBroadcaster>,

    prices: Arc<dyn PriceQuery>,

    connection_count: Arc<RwLock<usize>>,
}

impl PriceGateway {
    pub fn new(config: GatewayConfig, prices: Arc<dyn PriceQuery>) -> Self {
        Self {
            config,
            broadcaster: Arc::new(PriceBroadcaster::new()),
            prices,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Start forwarding engine batches to connected clients
    pub fn spawn_broadcaster(&self, batches: mpsc::Receiver<PriceBatch>) -> JoinHandle<()> {
        tokio::spawn(self.broadcaster.clone().run(batches))
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> GatewayResult<()> {
        let addr = self
            .config
            .server_addr()
            .map_err(|e| GatewayError::Config(format!("Invalid server address: {e}")))?;

        let listener = TcpListener::bind(addr).await?;
        info!("PriceGateway listening on {}", addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = self.handle_connection(stream, peer_addr).await {
                            warn!("Rejected connection from {}: {}", peer_addr, e);
                        }
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("PriceGateway stopped accepting connections");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> GatewayResult<()> {
        {
            let mut count = self.connection_count.write().await;
            if *count >= self.config.server.max_connections {
                return Err(GatewayError::Connection("Connection limit exceeded".to_string()));
            }
            *count += 1;
        }

        let mut handler = WebSocketHandler::new(
            peer_addr,
            self.broadcaster.clone(),
            self.prices.clone(),
            self.config.broadcast.client_queue_capacity,
        );

        let connection_count = self.connection_count.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(stream).await {
                error!("WebSocket handler error: {}", e);
            }

            let mut count = connection_count.write().await;
            *count = count.saturating_sub(1);
        });

        Ok(())
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> usize {
        *self.connection_count.read().await
    }

    pub fn broadcaster(&self) -> Arc<PriceBroadcaster> {
        self.broadcaster.clone()
    }
}
