use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::calculator::{PriceCalculator, PriceDecision};
use crate::config::{EngineConfig, PricingConfig};
use crate::error::{PricingError, Result};
use crate::metrics::{EngineMetrics, MetricsCollector};
use crate::models::{
    OpportunityId, OpportunityPriceState, OpportunityStatus, OutletCalibration, PriceBatch,
    PriceCommit, PriceSnapshot, PriceSource, PriceUpdateEvent, PricingVariable, Tier, TickReport,
    TickSeq, Trend,
};
use crate::registry::VariableRegistry;
use crate::sampler::SignalSampler;
use crate::store::{load_engine_config_or, PricingStores};

/// Read side of the price store, used by display, billing and the push layer
#[async_trait]
pub trait PriceQuery: Send + Sync {
    async fn all_prices(&self) -> Result<Vec<OpportunityPriceState>>;

    /// Fails with `OpportunityNotFound` for an unknown id
    async fn price(&self, opportunity_id: OpportunityId) -> Result<OpportunityPriceState>;

    /// Open prices tagged with the last completed tick
    async fn snapshot(&self) -> Result<PriceSnapshot>;
}

/// Everything a tick reads up front; immutable for the rest of the tick
#[derive(Debug, Clone)]
pub struct TickContext {
    pub tick_seq: TickSeq,
    pub started_at: DateTime<Utc>,
    pub engine: EngineConfig,
    pub variables: Vec<PricingVariable>,
    pub variable_names: Vec<String>,
    pub calibrations: HashMap<String, OutletCalibration>,
}

enum Outcome {
    Updated(PriceUpdateEvent),
    Unchanged,
    Failed,
}

/// Tick-driven price computation engine. The only writer of `current_price`.
pub struct PricingEngine {
    config: PricingConfig,
    stores: PricingStores,
    registry: VariableRegistry,
    sampler: SignalSampler,
    calculator: PriceCalculator,
    tick_seq: AtomicU64,
    last_completed_seq: AtomicU64,
    event_sink: Option<mpsc::Sender<PriceBatch>>,
    metrics: Arc<MetricsCollector>,
}

impl PricingEngine {
    pub fn new(config: PricingConfig, stores: PricingStores) -> Self {
        let registry = VariableRegistry::new(stores.variables.clone());
        let sampler = SignalSampler::new(stores.activity.clone());
        let calculator = PriceCalculator::new(config.tiers, config.calibration_confidence_threshold);
        let initial_seq = initial_tick_seq();

        Self {
            config,
            stores,
            registry,
            sampler,
            calculator,
            tick_seq: AtomicU64::new(initial_seq),
            last_completed_seq: AtomicU64::new(initial_seq),
            event_sink: None,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Hand committed batches to the broadcast layer through `sink`
    pub fn with_event_sink(mut self, sink: mpsc::Sender<PriceBatch>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.snapshot()
    }

    pub(crate) fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Sequence number of the last completed tick
    pub fn last_completed_seq(&self) -> TickSeq {
        self.last_completed_seq.load(Ordering::SeqCst)
    }

    /// Stored engine config, sanitized into range. Falls back to the process
    /// config when nothing is stored or the store is unreachable.
    pub async fn current_engine_config(&self) -> EngineConfig {
        let stored = match load_engine_config_or(self.stores.engine_config.as_ref(), self.config.engine).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load engine config, using process defaults: {}", e);
                self.config.engine
            }
        };

        let (config, changed) = stored.sanitized();
        if changed {
            warn!(
                "Stored engine config {:?} is out of range, using {:?}",
                stored, config
            );
        }
        config
    }

    /// Read config, variables and calibrations once for this tick
    pub async fn load_tick_context(&self, tick_seq: TickSeq) -> Result<TickContext> {
        let engine = self.current_engine_config().await;
        let variables = self.registry.get_all().await?;
        let calibrations = self.stores.calibrations.load_calibrations().await?;
        let variable_names = variables.iter().map(|v| v.name.clone()).collect();

        Ok(TickContext {
            tick_seq,
            started_at: Utc::now(),
            engine,
            variables,
            variable_names,
            calibrations,
        })
    }

    /// Run one pricing tick over every open opportunity.
    ///
    /// Fails only when the tick context or the open opportunity list cannot be
    /// read; per-opportunity failures are counted in the report.
    pub async fn run_tick(&self) -> Result<TickReport> {
        let started = Instant::now();
        let tick_seq = self.tick_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let context = self.load_tick_context(tick_seq).await?;
        let states = self.stores.states.load_open_states().await?;
        let processed = states.len();

        debug!(
            "Tick {} starting: {} open opportunities, {} variables, price step {}",
            tick_seq,
            processed,
            context.variables.len(),
            context.engine.price_step
        );

        if context.variables.is_empty() {
            debug!("Tick {}: no pricing variables registered, prices unchanged", tick_seq);
            return Ok(self.finish_tick(tick_seq, started, processed, Vec::new(), 0));
        }

        let timeout = self.config.opportunity_timeout();
        let outcomes: Vec<Outcome> = stream::iter(states)
            .map(|state| {
                let context = &context;
                async move {
                    let opportunity_id = state.opportunity_id;
                    let result = tokio::time::timeout(timeout, self.price_opportunity(context, state))
                        .await
                        .unwrap_or(Err(PricingError::Timeout(opportunity_id, timeout)));

                    match result {
                        Ok(Some(event)) => Outcome::Updated(event),
                        Ok(None) => Outcome::Unchanged,
                        Err(e) => {
                            warn!("Tick {}: opportunity {} left unchanged: {}", tick_seq, opportunity_id, e);
                            Outcome::Failed
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrent_opportunities)
            .collect()
            .await;

        let mut events = Vec::new();
        let mut failed = 0;
        for outcome in outcomes {
            match outcome {
                Outcome::Updated(event) => events.push(event),
                Outcome::Unchanged => {}
                Outcome::Failed => failed += 1,
            }
        }
        events.sort_by_key(|event| event.opportunity_id);

        if !events.is_empty() {
            self.publish_batch(PriceBatch { tick_seq, events: events.clone() });
        }

        Ok(self.finish_tick(tick_seq, started, processed, events, failed))
    }

    fn finish_tick(
        &self,
        tick_seq: TickSeq,
        started: Instant,
        processed: usize,
        events: Vec<PriceUpdateEvent>,
        failed: usize,
    ) -> TickReport {
        self.last_completed_seq.fetch_max(tick_seq, Ordering::SeqCst);

        let report = TickReport {
            tick_seq,
            processed,
            updated: events.len(),
            unchanged: processed - events.len() - failed,
            failed,
            duration: started.elapsed(),
        };
        self.metrics.record_tick(&report);
        report
    }

    /// Sample, score, bound and commit a single opportunity
    async fn price_opportunity(
        &self,
        context: &TickContext,
        state: OpportunityPriceState,
    ) -> Result<Option<PriceUpdateEvent>> {
        let readings = self
            .sampler
            .sample(state.opportunity_id, &context.variable_names, context.started_at)
            .await;

        let score = PriceCalculator::score(&context.variables, &readings);
        let bounds = self.calculator.resolve_bounds(&state, context.calibrations.get(&state.outlet));
        let decision = self.calculator.decide(&state, score, context.engine.price_step, &bounds)?;

        let PriceDecision::Update { new_price, trend } = decision else {
            if bounds.floor_price != state.floor_price || bounds.cutoff_price != state.cutoff_price {
                debug!(
                    "Opportunity {}: bounds [{}, {}] -> [{}, {}] at unchanged price {}",
                    state.opportunity_id,
                    state.floor_price,
                    state.cutoff_price,
                    bounds.floor_price,
                    bounds.cutoff_price,
                    state.current_price
                );
                self.stores
                    .states
                    .update_bounds(state.opportunity_id, bounds.floor_price, bounds.cutoff_price)
                    .await?;
            }
            return Ok(None);
        };

        let timestamp = Utc::now();
        let commit = PriceCommit {
            opportunity_id: state.opportunity_id,
            expected_price: state.current_price,
            new_price,
            floor_price: bounds.floor_price,
            cutoff_price: bounds.cutoff_price,
            trend,
            timestamp,
        };

        if !self.stores.states.commit_price(&commit).await? {
            debug!(
                "Commit for opportunity {} refused (closed or changed since tick start)",
                state.opportunity_id
            );
            return Ok(None);
        }

        debug!(
            "Opportunity {}: {} -> {} (score {:.3}, bounds [{}, {}])",
            state.opportunity_id, state.current_price, new_price, score, bounds.floor_price, bounds.cutoff_price
        );

        Ok(Some(PriceUpdateEvent {
            opportunity_id: state.opportunity_id,
            old_price: state.current_price,
            new_price,
            trend_sign: trend.sign(),
            timestamp,
            source: PriceSource::Scheduler,
            tick_seq: context.tick_seq,
        }))
    }

    fn publish_batch(&self, batch: PriceBatch) {
        let Some(sink) = &self.event_sink else {
            return;
        };

        let tick_seq = batch.tick_seq;
        match sink.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                warn!(
                    "Broadcast queue full, dropping {} events from tick {}",
                    batch.events.len(),
                    tick_seq
                );
                self.metrics.record_broadcast_failure();
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Broadcast queue closed, dropping events from tick {}", tick_seq);
                self.metrics.record_broadcast_failure();
            }
        }
    }

    /// Create the price state of a newly published opportunity at its tier's
    /// base price and default bounds
    pub async fn publish_opportunity(
        &self,
        opportunity_id: OpportunityId,
        outlet: &str,
        tier: Tier,
    ) -> Result<OpportunityPriceState> {
        let defaults = self.config.tiers.for_tier(tier);
        let state = OpportunityPriceState {
            opportunity_id,
            outlet: outlet.to_string(),
            current_price: defaults.base_price,
            base_price: defaults.base_price,
            floor_price: defaults.floor_price,
            cutoff_price: defaults.cutoff_price,
            tier,
            status: OpportunityStatus::Open,
            last_price_update: Utc::now(),
            trend: Trend::Stable,
        };

        self.stores.states.insert_state(&state).await?;
        info!(
            "Published opportunity {} for outlet {} (tier {}) at {}",
            opportunity_id,
            outlet,
            u8::from(tier),
            state.current_price
        );
        Ok(state)
    }

    /// Freeze an opportunity's price. Closing twice is a no-op.
    pub async fn close_opportunity(&self, opportunity_id: OpportunityId) -> Result<()> {
        if self.stores.states.close_opportunity(opportunity_id, Utc::now()).await? {
            info!("Closed opportunity {}", opportunity_id);
            return Ok(());
        }

        match self.stores.states.find_state(opportunity_id).await? {
            Some(_) => {
                debug!("Opportunity {} already closed", opportunity_id);
                Ok(())
            }
            None => Err(PricingError::OpportunityNotFound(opportunity_id)),
        }
    }
}

#[async_trait]
impl PriceQuery for PricingEngine {
    async fn all_prices(&self) -> Result<Vec<OpportunityPriceState>> {
        self.stores.states.load_all_states().await
    }

    async fn price(&self, opportunity_id: OpportunityId) -> Result<OpportunityPriceState> {
        self.stores
            .states
            .find_state(opportunity_id)
            .await?
            .ok_or(PricingError::OpportunityNotFound(opportunity_id))
    }

    async fn snapshot(&self) -> Result<PriceSnapshot> {
        let tick_seq = self.last_completed_seq();
        let prices = self.stores.states.load_open_states().await?;
        Ok(PriceSnapshot { tick_seq, taken_at: Utc::now(), prices })
    }
}

/// Tick sequences start from the wall clock so they keep increasing across
/// restarts; ticks are at least 30 s apart, so one per second never overtakes it.
fn initial_tick_seq() -> TickSeq {
    Utc::now().timestamp().max(0) as TickSeq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::{NonlinearFn, SignalReading};
    use crate::registry::VariableUpdate;
    use crate::sampler::Signal;
    use crate::store::ActivityStore;

    async fn setup() -> (Arc<MemoryStore>, PricingEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = PricingEngine::new(PricingConfig::default(), PricingStores::shared(store.clone()));
        (store, engine)
    }

    async fn weight(engine: &PricingEngine, name: &str, weight: f64) {
        engine
            .registry
            .upsert(name, VariableUpdate { weight: Some(weight), nonlinear_fn: Some(NonlinearFn::None.to_string()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tick_applies_bounded_delta() {
        let (store, engine) = setup().await;
        let (tx, mut rx) = mpsc::channel(8);
        let engine = engine.with_event_sink(tx);

        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        weight(&engine, "pitches_24h", 2.0).await;
        store.set_signal(1, Signal::Pitches24h, SignalReading::new(3.0, 1.0)).await;

        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 0);

        let state = engine.price(1).await.unwrap();
        assert_eq!(state.current_price, 205.0);
        assert_eq!(state.trend, Trend::Up);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.tick_seq, report.tick_seq);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].old_price, 200.0);
        assert_eq!(batch.events[0].new_price, 205.0);
        assert_eq!(batch.events[0].trend_sign, 1);
        assert_eq!(engine.last_completed_seq(), report.tick_seq);
    }

    #[tokio::test]
    async fn test_empty_registry_leaves_prices_unchanged() {
        let (store, engine) = setup().await;
        let (tx, mut rx) = mpsc::channel(8);
        let engine = engine.with_event_sink(tx);

        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        engine.publish_opportunity(2, "Forbes", Tier::One).await.unwrap();
        store.force_price(2, 900.0).await.unwrap();

        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.unchanged, 2);
        assert_eq!(engine.price(1).await.unwrap().current_price, 200.0);
        assert_eq!(engine.price(2).await.unwrap().current_price, 900.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_price_clamped_to_cutoff() {
        let (store, engine) = setup().await;
        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        store.force_price(1, 398.0).await.unwrap();
        weight(&engine, "pitches_24h", 2.0).await;
        store.set_signal(1, Signal::Pitches24h, SignalReading::new(3.0, 0.0)).await;

        engine.run_tick().await.unwrap();
        assert_eq!(engine.price(1).await.unwrap().current_price, 400.0);

        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(engine.price(1).await.unwrap().current_price, 400.0);
    }

    #[tokio::test]
    async fn test_confident_calibration_sets_bounds() {
        let (store, engine) = setup().await;
        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        store
            .set_calibration(&OutletCalibration {
                outlet: "Wired".to_string(),
                avg_price: 150.0,
                recommended_floor: 90.0,
                recommended_ceiling: 202.0,
                confidence_score: 0.75,
                sample_size: 12,
                last_calibration: Utc::now(),
            })
            .await;
        weight(&engine, "pitches_24h", 1.0).await;
        store.set_signal(1, Signal::Pitches24h, SignalReading::new(10.0, 0.0)).await;

        engine.run_tick().await.unwrap();
        let state = engine.price(1).await.unwrap();
        assert_eq!(state.current_price, 202.0);
        assert_eq!(state.floor_price, 90.0);
        assert_eq!(state.cutoff_price, 202.0);
    }

    fn wired_calibration(floor: f64, ceiling: f64) -> OutletCalibration {
        OutletCalibration {
            outlet: "Wired".to_string(),
            avg_price: (floor + ceiling) / 2.0,
            recommended_floor: floor,
            recommended_ceiling: ceiling,
            confidence_score: 0.75,
            sample_size: 12,
            last_calibration: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_narrowed_bounds_win_over_step_limit() {
        let (store, engine) = setup().await;
        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        store.force_price(1, 390.0).await.unwrap();
        store.set_calibration(&wired_calibration(90.0, 202.0)).await;
        weight(&engine, "pitches_24h", 1.0).await;
        store.set_signal(1, Signal::Pitches24h, SignalReading::new(1.0, 0.0)).await;

        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.updated, 1);
        let state = engine.price(1).await.unwrap();
        assert_eq!(state.current_price, 202.0);
        assert_eq!(state.trend, Trend::Down);

        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(engine.price(1).await.unwrap().current_price, 202.0);
    }

    #[tokio::test]
    async fn test_bounds_saved_when_price_unchanged() {
        let (store, engine) = setup().await;
        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        weight(&engine, "pitches_24h", 1.0).await;
        store.set_calibration(&wired_calibration(90.0, 210.0)).await;

        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.unchanged, 1);

        let state = engine.price(1).await.unwrap();
        assert_eq!(state.current_price, 200.0);
        assert_eq!(state.floor_price, 90.0);
        assert_eq!(state.cutoff_price, 210.0);

        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.prices[0].cutoff_price, 210.0);
    }

    #[tokio::test]
    async fn test_overflowing_score_moves_one_step() {
        let (store, engine) = setup().await;
        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        weight(&engine, "pitches_24h", 1e300).await;
        store.set_signal(1, Signal::Pitches24h, SignalReading::new(1e10, 0.0)).await;

        let report = tokio_test::assert_ok!(engine.run_tick().await);
        assert_eq!(report.failed, 0);
        assert_eq!(report.updated, 1);
        assert_eq!(engine.price(1).await.unwrap().current_price, 205.0);
    }

    #[tokio::test]
    async fn test_closed_opportunity_is_frozen() {
        let (store, engine) = setup().await;
        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        engine.publish_opportunity(2, "Wired", Tier::Two).await.unwrap();
        weight(&engine, "pitches_24h", 1.0).await;
        store.set_signal(1, Signal::Pitches24h, SignalReading::new(2.0, 0.0)).await;
        store.set_signal(2, Signal::Pitches24h, SignalReading::new(2.0, 0.0)).await;

        engine.close_opportunity(2).await.unwrap();
        engine.close_opportunity(2).await.unwrap();

        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(engine.price(1).await.unwrap().current_price, 202.0);
        assert_eq!(engine.price(2).await.unwrap().current_price, 200.0);

        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.prices.len(), 1);
        assert_eq!(snapshot.tick_seq, report.tick_seq);
        assert!(matches!(
            engine.close_opportunity(99).await,
            Err(PricingError::OpportunityNotFound(99))
        ));
    }

    struct SlowActivity {
        inner: Arc<MemoryStore>,
        slow_id: OpportunityId,
    }

    #[async_trait]
    impl ActivityStore for SlowActivity {
        async fn read_signal(
            &self,
            opportunity_id: OpportunityId,
            signal: Signal,
            now: DateTime<Utc>,
        ) -> Result<SignalReading> {
            if opportunity_id == self.slow_id {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
            self.inner.read_signal(opportunity_id, signal, now).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_opportunity_is_isolated() {
        let store = Arc::new(MemoryStore::new());
        let mut stores = PricingStores::shared(store.clone());
        stores.activity = Arc::new(SlowActivity { inner: store.clone(), slow_id: 2 });
        let engine = PricingEngine::new(PricingConfig::default(), stores);

        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        engine.publish_opportunity(2, "Wired", Tier::Two).await.unwrap();
        weight(&engine, "pitches_24h", 1.0).await;
        store.set_signal(1, Signal::Pitches24h, SignalReading::new(3.0, 0.0)).await;
        store.set_signal(2, Signal::Pitches24h, SignalReading::new(3.0, 0.0)).await;

        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(engine.price(1).await.unwrap().current_price, 203.0);
        assert_eq!(engine.price(2).await.unwrap().current_price, 200.0);
        assert_eq!(engine.metrics().total_opportunity_failures, 1);
    }

    #[tokio::test]
    async fn test_full_broadcast_queue_does_not_fail_tick() {
        let (store, engine) = setup().await;
        let (tx, _rx) = mpsc::channel(1);
        let engine = engine.with_event_sink(tx);

        engine.publish_opportunity(1, "Wired", Tier::Two).await.unwrap();
        weight(&engine, "pitches_24h", 1.0).await;
        store.set_signal(1, Signal::Pitches24h, SignalReading::new(1.0, 0.0)).await;

        engine.run_tick().await.unwrap();
        let report = engine.run_tick().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(engine.price(1).await.unwrap().current_price, 202.0);
        assert_eq!(engine.metrics().total_broadcast_failures, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_stored_config_is_sanitized() {
        let (store, engine) = setup().await;
        use crate::store::EngineConfigStore;
        store
            .save_engine_config(&EngineConfig { tick_interval_ms: 1_000, price_step: 50.0 })
            .await
            .unwrap();

        let config = engine.current_engine_config().await;
        assert_eq!(config.tick_interval_ms, crate::config::MIN_TICK_INTERVAL_MS);
        assert_eq!(config.price_step, crate::config::MAX_PRICE_STEP);
    }

    #[tokio::test]
    async fn test_tick_sequence_increases() {
        let (_store, engine) = setup().await;
        let first = engine.run_tick().await.unwrap();
        let second = engine.run_tick().await.unwrap();
        assert_eq!(second.tick_seq, first.tick_seq + 1);
    }
}
