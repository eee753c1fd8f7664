//! WebSocket connection handler for the price feed

use futures_util::{SinkExt, StreamExt};
use pricing_engine::PriceQuery;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::broadcaster::{ClientId, PriceBroadcaster};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::{
    Message as ApiMessage, SnapshotData, SubscribeParams, METHOD_PING, METHOD_SNAPSHOT,
    METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE, STREAM_PONG, STREAM_SNAPSHOT,
};

/// WebSocket connection handler
pub struct WebSocketHandler {
    client_id: ClientId,

    peer_addr: SocketAddr,

    broadcaster: Arc<PriceBroadcaster>,

    prices: Arc<dyn PriceQuery>,

    queue_capacity: usize,

    /// Outbound queue shared with the broadcaster
    sender: Option<mpsc::Sender<WsMessage>>,
}

impl WebSocketHandler {
    pub fn new(
        peer_addr: SocketAddr,
        broadcaster: Arc<PriceBroadcaster>,
        prices: Arc<dyn PriceQuery>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            peer_addr,
            broadcaster,
            prices,
            queue_capacity,
            sender: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Handle the WebSocket connection
    pub async fn handle(&mut self, stream: TcpStream) -> GatewayResult<()> {
        info!("Handling WebSocket connection from {}", self.peer_addr);

        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<WsMessage>(self.queue_capacity);
        self.attach(tx).await;

        let sender_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_sender.send(message).await {
                    debug!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Close(_)) => break,
                Ok(message) => {
                    if let Err(e) = self.handle_message(message).await {
                        warn!("Failed to handle message from {}: {}", self.peer_addr, e);
                    }
                }
                Err(e) => {
                    error!("WebSocket error from {}: {}", self.peer_addr, e);
                    break;
                }
            }
        }

        self.broadcaster.remove_client(&self.client_id).await;
        sender_task.abort();

        info!("WebSocket connection from {} closed", self.peer_addr);
        Ok(())
    }

    /// Register the outbound queue with the broadcaster
    pub async fn attach(&mut self, sender: mpsc::Sender<WsMessage>) {
        self.broadcaster.add_client(self.client_id.clone(), sender.clone()).await;
        self.sender = Some(sender);
    }

    async fn handle_message(&self, message: WsMessage) -> GatewayResult<()> {
        match message {
            WsMessage::Text(text) => self.handle_text_message(&text).await,
            WsMessage::Ping(data) => self.send_message(WsMessage::Pong(data)).await,
            WsMessage::Binary(_) => {
                warn!("Received binary message from {}, ignoring", self.peer_addr);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Dispatch one JSON request. Failures are answered with an `error`
    /// message carrying the request id.
    pub async fn handle_text_message(&self, text: &str) -> GatewayResult<()> {
        let message: ApiMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                let err = GatewayError::InvalidRequest(format!("Malformed message: {e}"));
                self.send_json_message(ApiMessage::error(None, err.code(), err.to_string())).await?;
                return Err(err);
            }
        };

        let id = message.id.clone();
        if let Err(e) = self.dispatch(message).await {
            debug!("Request {:?} from {} failed: {}", id, self.peer_addr, e);
            self.send_json_message(ApiMessage::error(id, e.code(), e.to_string())).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, message: ApiMessage) -> GatewayResult<()> {
        match message.method.as_deref() {
            Some(METHOD_SUBSCRIBE) => {
                let params = parse_params(message.params)?;
                let subscribed = match &params.opportunity_ids {
                    Some(ids) => serde_json::json!(ids),
                    None => serde_json::json!("all"),
                };
                self.broadcaster.subscribe(&self.client_id, params.opportunity_ids).await;
                self.send_json_message(ApiMessage::response(
                    message.id,
                    serde_json::json!({ "subscribed": subscribed }),
                ))
                .await
            }
            Some(METHOD_UNSUBSCRIBE) => {
                let params = parse_params(message.params)?;
                self.broadcaster.unsubscribe(&self.client_id, params.opportunity_ids).await;
                self.send_json_message(ApiMessage::response(message.id, serde_json::json!({ "ok": true })))
                    .await
            }
            Some(METHOD_SNAPSHOT) => {
                let snapshot = self.prices.snapshot().await?;
                let data = serde_json::to_value(SnapshotData::from(&snapshot))?;
                let mut reply = ApiMessage::stream(STREAM_SNAPSHOT, data);
                reply.id = message.id;
                self.send_json_message(reply).await
            }
            Some(METHOD_PING) => {
                let mut reply = ApiMessage::stream(
                    STREAM_PONG,
                    serde_json::json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
                );
                reply.id = message.id;
                self.send_json_message(reply).await
            }
            Some(other) => Err(GatewayError::UnknownMethod(other.to_string())),
            None => Err(GatewayError::InvalidRequest("Missing method".to_string())),
        }
    }

    async fn send_json_message(&self, message: ApiMessage) -> GatewayResult<()> {
        let json = serde_json::to_string(&message)?;
        self.send_message(WsMessage::Text(json)).await
    }

    async fn send_message(&self, message: WsMessage) -> GatewayResult<()> {
        if let Some(sender) = &self.sender {
            sender
                .send(message)
                .await
                .map_err(|_| GatewayError::Connection("Failed to send message".to_string()))?;
        }
        Ok(())
    }
}

fn parse_params(params: Option<serde_json::Value>) -> GatewayResult<SubscribeParams> {
    match params {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid subscription parameters: {e}"))),
        None => Ok(SubscribeParams::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Subscription;
    use crate::messages::STREAM_ERROR;
    use pricing_engine::{MemoryStore, PricingConfig, PricingEngine, PricingStores, Tier};

    async fn handler() -> (WebSocketHandler, mpsc::Receiver<WsMessage>, Arc<PriceBroadcaster>) {
        let store = Arc::new(MemoryStore::new());
        let engine = PricingEngine::new(PricingConfig::default(), PricingStores::shared(store));
        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();

        let broadcaster = Arc::new(PriceBroadcaster::new());
        let mut handler = WebSocketHandler::new(
            "127.0.0.1:9000".parse().unwrap(),
            broadcaster.clone(),
            Arc::new(engine),
            8,
        );
        let (tx, rx) = mpsc::channel(8);
        handler.attach(tx).await;
        (handler, rx, broadcaster)
    }

    fn next_message(rx: &mut mpsc::Receiver<WsMessage>) -> ApiMessage {
        match rx.try_recv().unwrap() {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_all() {
        let (handler, mut rx, broadcaster) = handler().await;
        handler.handle_text_message(r#"{"id":"1","method":"prices.subscribe"}"#).await.unwrap();

        let reply = next_message(&mut rx);
        assert_eq!(reply.id.as_deref(), Some("1"));
        assert_eq!(reply.result.unwrap()["subscribed"], "all");
        assert_eq!(broadcaster.subscription(handler.client_id()).await, Some(Subscription::All));
    }

    #[tokio::test]
    async fn test_snapshot_request() {
        let (handler, mut rx, _) = handler().await;
        handler.handle_text_message(r#"{"id":"2","method":"prices.snapshot"}"#).await.unwrap();

        let reply = next_message(&mut rx);
        assert_eq!(reply.stream.as_deref(), Some(STREAM_SNAPSHOT));
        let data: SnapshotData = serde_json::from_value(reply.data.unwrap()).unwrap();
        assert_eq!(data.prices.len(), 1);
        assert_eq!(data.prices[0].current_price, 200.0);
    }

    #[tokio::test]
    async fn test_ping_and_unknown_method() {
        let (handler, mut rx, _) = handler().await;
        handler.handle_text_message(r#"{"id":"3","method":"ping"}"#).await.unwrap();
        assert_eq!(next_message(&mut rx).stream.as_deref(), Some(STREAM_PONG));

        handler.handle_text_message(r#"{"id":"4","method":"orders.place"}"#).await.unwrap();
        let reply = next_message(&mut rx);
        assert_eq!(reply.stream.as_deref(), Some(STREAM_ERROR));
        assert_eq!(reply.id.as_deref(), Some("4"));
        assert_eq!(reply.error.unwrap().code, 40400);
    }

    #[tokio::test]
    async fn test_malformed_message_is_answered() {
        let (handler, mut rx, _) = handler().await;
        tokio_test::assert_err!(handler.handle_text_message("not json").await);
        assert_eq!(next_message(&mut rx).error.unwrap().code, 40000);
    }
}
