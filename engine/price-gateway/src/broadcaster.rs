//! Price broadcasting to connected WebSocket clients

use pricing_engine::{OpportunityId, PriceBatch};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::GatewayResult;
use crate::messages::{Message, PriceBatchUpdate, PriceUpdate, STREAM_PRICE_BATCH, STREAM_PRICE_UPDATE};

pub type ClientId = String;

/// Which opportunities a client receives pushes for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Connected but not subscribed
    Nothing,
    All,
    Only(HashSet<OpportunityId>),
}

impl Subscription {
    fn includes(&self, opportunity_id: OpportunityId) -> bool {
        match self {
            Subscription::Nothing => false,
            Subscription::All => true,
            Subscription::Only(ids) => ids.contains(&opportunity_id),
        }
    }
}

struct ClientHandle {
    sender: mpsc::Sender<WsMessage>,
    subscription: Subscription,
}

/// Outcome of publishing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

/// Fans committed price batches out to subscribed clients.
///
/// Every client has a bounded outbound queue. A full queue drops the message
/// for that client only (it reconciles from a snapshot later); a closed queue
/// removes the client.
pub struct PriceBroadcaster {
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
}

impl Default for PriceBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceBroadcaster {
    pub fn new() -> Self {
        Self { clients: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Register a client. It receives nothing until it subscribes.
    pub async fn add_client(&self, client_id: ClientId, sender: mpsc::Sender<WsMessage>) {
        let mut clients = self.clients.write().await;
        clients.insert(client_id, ClientHandle { sender, subscription: Subscription::Nothing });
        metrics::gauge!("gateway_connected_clients", clients.len() as f64);
    }

    pub async fn remove_client(&self, client_id: &str) {
        let mut clients = self.clients.write().await;
        clients.remove(client_id);
        metrics::gauge!("gateway_connected_clients", clients.len() as f64);
    }

    /// Subscribe to `ids`, or to everything when `ids` is `None`.
    /// Returns false for an unknown client.
    pub async fn subscribe(&self, client_id: &str, ids: Option<Vec<OpportunityId>>) -> bool {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.get_mut(client_id) else {
            return false;
        };

        client.subscription = match (ids, &client.subscription) {
            (None, _) => Subscription::All,
            (Some(_), Subscription::All) => Subscription::All,
            (Some(ids), Subscription::Only(existing)) => {
                Subscription::Only(existing.iter().copied().chain(ids).collect())
            }
            (Some(ids), Subscription::Nothing) => Subscription::Only(ids.into_iter().collect()),
        };
        true
    }

    /// Drop `ids` from the subscription, or everything when `ids` is `None`
    pub async fn unsubscribe(&self, client_id: &str, ids: Option<Vec<OpportunityId>>) -> bool {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.get_mut(client_id) else {
            return false;
        };

        client.subscription = match (ids, &client.subscription) {
            (None, _) => Subscription::Nothing,
            (Some(ids), Subscription::Only(existing)) => {
                let remaining: HashSet<_> =
                    existing.iter().copied().filter(|id| !ids.contains(id)).collect();
                if remaining.is_empty() {
                    Subscription::Nothing
                } else {
                    Subscription::Only(remaining)
                }
            }
            // unsubscribing single ids from "all" is not tracked
            (Some(_), current) => current.clone(),
        };
        true
    }

    pub async fn subscription(&self, client_id: &str) -> Option<Subscription> {
        self.clients.read().await.get(client_id).map(|c| c.subscription.clone())
    }

    /// Push one batch. A client whose subscription matches one event gets a
    /// `price_update`, several get one `price_batch`, none get nothing.
    pub async fn publish(&self, batch: &PriceBatch) -> GatewayResult<PublishStats> {
        let mut stats = PublishStats::default();
        if batch.events.is_empty() {
            return Ok(stats);
        }

        let updates: Vec<PriceUpdate> = batch.events.iter().map(PriceUpdate::from).collect();
        let mut closed = Vec::new();

        {
            let clients = self.clients.read().await;
            for (client_id, client) in clients.iter() {
                let matching: Vec<&PriceUpdate> = updates
                    .iter()
                    .filter(|update| client.subscription.includes(update.opportunity_id))
                    .collect();

                let message = match matching.as_slice() {
                    [] => continue,
                    [single] => Message::stream(STREAM_PRICE_UPDATE, serde_json::to_value(single)?),
                    many => Message::stream(
                        STREAM_PRICE_BATCH,
                        serde_json::to_value(PriceBatchUpdate {
                            tick_seq: batch.tick_seq,
                            updates: many.iter().map(|u| (*u).clone()).collect(),
                        })?,
                    ),
                };

                let frame = WsMessage::Text(serde_json::to_string(&message)?);
                match client.sender.try_send(frame) {
                    Ok(()) => stats.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        debug!("Client {} queue full, dropping tick {}", client_id, batch.tick_seq);
                        stats.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => closed.push(client_id.clone()),
                }
            }
        }

        if !closed.is_empty() {
            let mut clients = self.clients.write().await;
            for client_id in &closed {
                clients.remove(client_id);
            }
            stats.removed = closed.len();
            metrics::gauge!("gateway_connected_clients", clients.len() as f64);
        }

        if stats.dropped > 0 {
            metrics::counter!("gateway_messages_dropped_total", stats.dropped as u64);
        }
        metrics::counter!("gateway_messages_delivered_total", stats.delivered as u64);

        Ok(stats)
    }

    /// Consume batches from the engine until the queue closes
    pub async fn run(self: Arc<Self>, mut batches: mpsc::Receiver<PriceBatch>) {
        info!("Price broadcaster started");

        while let Some(batch) = batches.recv().await {
            match self.publish(&batch).await {
                Ok(stats) => debug!(
                    "Tick {}: {} events -> {} delivered, {} dropped, {} removed",
                    batch.tick_seq,
                    batch.events.len(),
                    stats.delivered,
                    stats.dropped,
                    stats.removed
                ),
                Err(e) => warn!("Failed to publish tick {}: {}", batch.tick_seq, e),
            }
        }

        info!("Price broadcaster stopped: engine queue closed");
    }

    /// Get the number of connected clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pricing_engine::{PriceSource, PriceUpdateEvent};

    fn event(opportunity_id: OpportunityId, tick_seq: u64) -> PriceUpdateEvent {
        PriceUpdateEvent {
            opportunity_id,
            old_price: 200.0,
            new_price: 205.0,
            trend_sign: 1,
            timestamp: Utc::now(),
            source: PriceSource::Scheduler,
            tick_seq,
        }
    }

    fn stream_of(frame: WsMessage) -> (String, serde_json::Value) {
        let WsMessage::Text(text) = frame else {
            panic!("expected text frame");
        };
        let message: Message = serde_json::from_str(&text).unwrap();
        (message.stream.unwrap(), message.data.unwrap())
    }

    #[tokio::test]
    async fn test_single_event_sends_price_update() {
        let broadcaster = PriceBroadcaster::new();
        let (tx, mut rx) = mpsc::channel(4);
        broadcaster.add_client("a".into(), tx).await;
        broadcaster.subscribe("a", None).await;

        let stats = broadcaster.publish(&PriceBatch { tick_seq: 3, events: vec![event(1, 3)] }).await.unwrap();
        assert_eq!(stats.delivered, 1);

        let (stream, data) = stream_of(rx.try_recv().unwrap());
        assert_eq!(stream, STREAM_PRICE_UPDATE);
        assert_eq!(data["opportunity_id"], 1);
        assert_eq!(data["tick_seq"], 3);
    }

    #[tokio::test]
    async fn test_multiple_events_send_one_batch() {
        let broadcaster = PriceBroadcaster::new();
        let (tx, mut rx) = mpsc::channel(4);
        broadcaster.add_client("a".into(), tx).await;
        broadcaster.subscribe("a", None).await;

        broadcaster
            .publish(&PriceBatch { tick_seq: 9, events: vec![event(1, 9), event(2, 9)] })
            .await
            .unwrap();

        let (stream, data) = stream_of(rx.try_recv().unwrap());
        assert_eq!(stream, STREAM_PRICE_BATCH);
        assert_eq!(data["updates"].as_array().unwrap().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_and_unsubscribed_clients_get_nothing() {
        let broadcaster = PriceBroadcaster::new();
        let (tx, mut rx) = mpsc::channel(4);
        broadcaster.add_client("a".into(), tx).await;

        let stats = broadcaster.publish(&PriceBatch { tick_seq: 1, events: vec![event(1, 1)] }).await.unwrap();
        assert_eq!(stats, PublishStats::default());

        broadcaster.subscribe("a", None).await;
        broadcaster.publish(&PriceBatch { tick_seq: 2, events: vec![] }).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscription_filters_events() {
        let broadcaster = PriceBroadcaster::new();
        let (tx, mut rx) = mpsc::channel(4);
        broadcaster.add_client("a".into(), tx).await;
        broadcaster.subscribe("a", Some(vec![2])).await;

        broadcaster
            .publish(&PriceBatch { tick_seq: 5, events: vec![event(1, 5), event(2, 5)] })
            .await
            .unwrap();

        let (stream, data) = stream_of(rx.try_recv().unwrap());
        assert_eq!(stream, STREAM_PRICE_UPDATE);
        assert_eq!(data["opportunity_id"], 2);

        broadcaster.unsubscribe("a", Some(vec![2])).await;
        assert_eq!(broadcaster.subscription("a").await, Some(Subscription::Nothing));
    }

    #[tokio::test]
    async fn test_slow_client_drops_and_closed_client_is_removed() {
        let broadcaster = PriceBroadcaster::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (gone_tx, gone_rx) = mpsc::channel(1);
        broadcaster.add_client("slow".into(), slow_tx).await;
        broadcaster.add_client("gone".into(), gone_tx).await;
        broadcaster.subscribe("slow", None).await;
        broadcaster.subscribe("gone", None).await;
        drop(gone_rx);

        let first = broadcaster.publish(&PriceBatch { tick_seq: 1, events: vec![event(1, 1)] }).await.unwrap();
        assert_eq!(first.delivered, 1);
        assert_eq!(first.removed, 1);
        assert_eq!(broadcaster.client_count().await, 1);

        let second = broadcaster.publish(&PriceBatch { tick_seq: 2, events: vec![event(1, 2)] }).await.unwrap();
        assert_eq!(second.dropped, 1);
        assert_eq!(broadcaster.client_count().await, 1);
    }
}
