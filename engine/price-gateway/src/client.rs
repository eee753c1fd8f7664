//! Client side of the price feed: a reconciling local price view
//!
//! Pushes are applied in tick order per opportunity. When pushes go quiet for
//! longer than the staleness window, or every reconcile interval regardless,
//! the client pulls a full snapshot.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use pricing_engine::{OpportunityId, TickSeq};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::messages::{
    Message, PriceBatchUpdate, PriceUpdate, SnapshotData, METHOD_SNAPSHOT, METHOD_SUBSCRIBE,
    STREAM_ERROR, STREAM_PRICE_BATCH, STREAM_PRICE_UPDATE, STREAM_SNAPSHOT,
};

/// Last known price of one opportunity
#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntry {
    pub price: f64,
    pub trend_sign: i8,
    pub tick_seq: TickSeq,
    pub timestamp: DateTime<Utc>,
}

pub struct PriceView {
    config: ReconcileConfig,
    entries: HashMap<OpportunityId, ViewEntry>,
    snapshot_seq: Option<TickSeq>,
    last_activity: Instant,
    last_reconcile: Option<Instant>,
}

impl PriceView {
    pub fn new(config: ReconcileConfig, now: Instant) -> Self {
        Self { config, entries: HashMap::new(), snapshot_seq: None, last_activity: now, last_reconcile: None }
    }

    pub fn price(&self, opportunity_id: OpportunityId) -> Option<&ViewEntry> {
        self.entries.get(&opportunity_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one pushed update. Returns false when it is older than what the
    /// view already holds: a lower tick sequence, or the same tick with an
    /// older timestamp.
    pub fn apply_update(&mut self, update: &PriceUpdate, now: Instant) -> bool {
        self.last_activity = now;

        if let Some(existing) = self.entries.get(&update.opportunity_id) {
            let stale = update.tick_seq < existing.tick_seq
                || (update.tick_seq == existing.tick_seq && update.timestamp < existing.timestamp);
            if stale {
                debug!(
                    "Discarding update for {} from tick {} (have tick {})",
                    update.opportunity_id, update.tick_seq, existing.tick_seq
                );
                return false;
            }
        }

        self.entries.insert(
            update.opportunity_id,
            ViewEntry {
                price: update.new_price,
                trend_sign: update.trend_sign,
                tick_seq: update.tick_seq,
                timestamp: update.timestamp,
            },
        );
        true
    }

    /// Apply every update of a batch; returns how many were applied
    pub fn apply_batch(&mut self, batch: &PriceBatchUpdate, now: Instant) -> usize {
        batch.updates.iter().filter(|update| self.apply_update(update, now)).count()
    }

    /// Replace the view with a snapshot unless a newer snapshot was already
    /// applied. Entries pushed after the snapshot's tick are kept; entries
    /// absent from the snapshot are closed and dropped.
    pub fn apply_snapshot(&mut self, snapshot: &SnapshotData, now: Instant) -> bool {
        self.last_activity = now;
        self.last_reconcile = Some(now);

        if self.snapshot_seq.is_some_and(|seq| snapshot.tick_seq < seq) {
            debug!("Discarding snapshot at tick {}", snapshot.tick_seq);
            return false;
        }

        let mut entries = HashMap::with_capacity(snapshot.prices.len());
        for price in &snapshot.prices {
            let from_snapshot = ViewEntry {
                price: price.current_price,
                trend_sign: price.trend_sign,
                tick_seq: snapshot.tick_seq,
                timestamp: price.last_price_update,
            };
            let entry = match self.entries.remove(&price.opportunity_id) {
                Some(existing) if existing.tick_seq > snapshot.tick_seq => existing,
                _ => from_snapshot,
            };
            entries.insert(price.opportunity_id, entry);
        }

        self.entries = entries;
        self.snapshot_seq = Some(snapshot.tick_seq);
        true
    }

    /// Whether the client should pull a fresh snapshot now
    pub fn needs_reconciliation(&self, now: Instant) -> bool {
        let Some(last_reconcile) = self.last_reconcile else {
            return true;
        };
        now.saturating_duration_since(self.last_activity) >= self.config.staleness_window()
            || now.saturating_duration_since(last_reconcile) >= self.config.reconcile_interval()
    }

    /// Record that a snapshot was requested, so the next check waits for it
    pub fn mark_reconcile_requested(&mut self, now: Instant) {
        self.last_reconcile = Some(now);
        self.last_activity = now;
    }
}

/// WebSocket client keeping a `PriceView` in sync with the gateway
pub struct PriceFeedClient {
    url: String,
    view: Arc<RwLock<PriceView>>,
    check_interval: Duration,
}

impl PriceFeedClient {
    pub fn new(url: impl Into<String>, config: ReconcileConfig) -> Self {
        Self {
            url: url.into(),
            view: Arc::new(RwLock::new(PriceView::new(config, Instant::now()))),
            check_interval: Duration::from_secs(5),
        }
    }

    pub fn view(&self) -> Arc<RwLock<PriceView>> {
        self.view.clone()
    }

    /// Connect, subscribe to all prices and keep the view reconciled until
    /// the connection drops or `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> GatewayResult<()> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        info!("Connected to price feed at {}", self.url);

        let (mut sink, mut stream) = ws_stream.split();
        let mut request_id: u64 = 0;

        let subscribe = Message::request(next_id(&mut request_id), METHOD_SUBSCRIBE, None);
        sink.send(WsMessage::Text(serde_json::to_string(&subscribe)?)).await?;

        let mut check = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Price feed closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(GatewayError::WebSocket(e)),
                },
                _ = check.tick() => {
                    let now = Instant::now();
                    let mut view = self.view.write().await;
                    if view.needs_reconciliation(now) {
                        view.mark_reconcile_requested(now);
                        drop(view);
                        let request = Message::request(next_id(&mut request_id), METHOD_SNAPSHOT, None);
                        sink.send(WsMessage::Text(serde_json::to_string(&request)?)).await?;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_text(&self, text: &str) {
        let message: Message = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed price feed message: {}", e);
                return;
            }
        };

        let now = Instant::now();
        let data = message.data.unwrap_or_default();
        let mut view = self.view.write().await;

        let applied = match message.stream.as_deref() {
            Some(STREAM_PRICE_UPDATE) => serde_json::from_value::<PriceUpdate>(data)
                .map(|update| view.apply_update(&update, now) as usize),
            Some(STREAM_PRICE_BATCH) => serde_json::from_value::<PriceBatchUpdate>(data)
                .map(|batch| view.apply_batch(&batch, now)),
            Some(STREAM_SNAPSHOT) => serde_json::from_value::<SnapshotData>(data)
                .map(|snapshot| view.apply_snapshot(&snapshot, now) as usize),
            Some(STREAM_ERROR) => {
                warn!("Price feed error: {:?}", message.error);
                Ok(0)
            }
            _ => Ok(0),
        };

        if let Err(e) = applied {
            warn!("Ignoring undecodable price feed payload: {}", e);
        }
    }
}

fn next_id(counter: &mut u64) -> String {
    *counter += 1;
    counter.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SnapshotEntry;
    use chrono::TimeZone;

    fn ts(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, second).unwrap()
    }

    fn update(opportunity_id: OpportunityId, price: f64, tick_seq: TickSeq, second: u32) -> PriceUpdate {
        PriceUpdate {
            opportunity_id,
            old_price: price - 1.0,
            new_price: price,
            trend_sign: 1,
            timestamp: ts(second),
            tick_seq,
        }
    }

    fn snapshot(tick_seq: TickSeq, prices: &[(OpportunityId, f64)]) -> SnapshotData {
        SnapshotData {
            tick_seq,
            taken_at: ts(30),
            prices: prices
                .iter()
                .map(|&(opportunity_id, current_price)| SnapshotEntry {
                    opportunity_id,
                    outlet: "Wired".to_string(),
                    current_price,
                    floor_price: 125.0,
                    cutoff_price: 400.0,
                    trend_sign: 0,
                    last_price_update: ts(0),
                })
                .collect(),
        }
    }

    fn view() -> (PriceView, Instant) {
        let now = Instant::now();
        (PriceView::new(ReconcileConfig::default(), now), now)
    }

    #[test]
    fn test_older_tick_is_discarded() {
        let (mut view, now) = view();
        assert!(view.apply_update(&update(1, 210.0, 11, 5), now));
        assert!(!view.apply_update(&update(1, 205.0, 10, 9), now));
        assert_eq!(view.price(1).unwrap().price, 210.0);
        assert_eq!(view.price(1).unwrap().tick_seq, 11);
    }

    #[test]
    fn test_same_tick_last_write_wins() {
        let (mut view, now) = view();
        assert!(view.apply_update(&update(1, 210.0, 11, 5), now));
        assert!(!view.apply_update(&update(1, 211.0, 11, 4), now));
        assert!(view.apply_update(&update(1, 212.0, 11, 6), now));
        assert_eq!(view.price(1).unwrap().price, 212.0);
    }

    #[test]
    fn test_batch_applies_per_opportunity() {
        let (mut view, now) = view();
        view.apply_update(&update(2, 300.0, 12, 0), now);
        let batch = PriceBatchUpdate { tick_seq: 11, updates: vec![update(1, 201.0, 11, 0), update(2, 299.0, 11, 0)] };
        assert_eq!(view.apply_batch(&batch, now), 1);
        assert_eq!(view.price(2).unwrap().price, 300.0);
    }

    #[test]
    fn test_snapshot_replaces_view_but_keeps_newer_pushes() {
        let (mut view, now) = view();
        view.apply_update(&update(1, 210.0, 12, 0), now);
        view.apply_update(&update(2, 150.0, 9, 0), now);
        view.apply_update(&update(3, 120.0, 9, 0), now);

        assert!(view.apply_snapshot(&snapshot(10, &[(1, 205.0), (2, 155.0)]), now));
        assert_eq!(view.price(1).unwrap().price, 210.0);
        assert_eq!(view.price(2).unwrap().price, 155.0);
        assert!(view.price(3).is_none());

        assert!(!view.apply_snapshot(&snapshot(8, &[(1, 100.0)]), now));
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn test_reconciliation_schedule() {
        let (mut view, start) = view();
        assert!(view.needs_reconciliation(start));

        view.apply_snapshot(&snapshot(1, &[]), start);
        assert!(!view.needs_reconciliation(start + Duration::from_secs(30)));
        assert!(view.needs_reconciliation(start + Duration::from_secs(90)));

        // steady pushes still force a pull every reconcile interval
        for secs in (10..120).step_by(10) {
            view.apply_update(&update(1, 200.0 + secs as f64, secs, 0), start + Duration::from_secs(secs));
        }
        assert!(!view.needs_reconciliation(start + Duration::from_secs(115)));
        assert!(view.needs_reconciliation(start + Duration::from_secs(120)));
    }
}
