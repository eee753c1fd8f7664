//! In-memory implementation of every storage trait, for tests and local runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::config::EngineConfig;
use crate::config_keys::{
    calibration_entries, engine_config_entries, parse_calibrations, parse_engine_config,
    ENGINE_PRICE_STEP, ENGINE_TICK_INTERVAL_MS,
};
use crate::error::{PricingError, Result};
use crate::models::{
    OpportunityId, OpportunityPriceState, OpportunityStatus, OutletCalibration, PriceCommit,
    PricingVariable, SignalReading,
};
use crate::sampler::Signal;
use crate::store::{
    ActivityStore, CalibrationStore, EngineConfigStore, PriceStateStore, VariableStore,
};

#[derive(Default)]
pub struct MemoryStore {
    variables: RwLock<BTreeMap<String, PricingVariable>>,
    states: RwLock<BTreeMap<OpportunityId, OpportunityPriceState>>,
    /// Mirrors the `system_config` table
    config_entries: RwLock<BTreeMap<String, String>>,
    signals: RwLock<HashMap<(OpportunityId, Signal), SignalReading>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_signal(&self, opportunity_id: OpportunityId, signal: Signal, reading: SignalReading) {
        self.signals.write().await.insert((opportunity_id, signal), reading);
    }

    pub async fn set_calibration(&self, calibration: &OutletCalibration) {
        self.put_config_entries(calibration_entries(calibration)).await;
    }

    pub async fn put_config_entries<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.config_entries.write().await.extend(entries);
    }

    pub async fn config_entries(&self) -> BTreeMap<String, String> {
        self.config_entries.read().await.clone()
    }

    /// Overwrite a stored price directly, bypassing the commit path
    pub async fn force_price(&self, opportunity_id: OpportunityId, price: f64) -> Result<()> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(&opportunity_id)
            .ok_or(PricingError::OpportunityNotFound(opportunity_id))?;
        state.current_price = price;
        Ok(())
    }
}

#[async_trait]
impl VariableStore for MemoryStore {
    async fn load_variables(&self) -> Result<Vec<PricingVariable>> {
        Ok(self.variables.read().await.values().cloned().collect())
    }

    async fn find_variable(&self, name: &str) -> Result<Option<PricingVariable>> {
        Ok(self.variables.read().await.get(name).cloned())
    }

    async fn save_variable(&self, variable: &PricingVariable) -> Result<()> {
        self.variables.write().await.insert(variable.name.clone(), variable.clone());
        Ok(())
    }
}

#[async_trait]
impl EngineConfigStore for MemoryStore {
    async fn load_engine_config(&self) -> Result<Option<EngineConfig>> {
        let entries = self.config_entries.read().await;
        let tick_interval = entries.get(ENGINE_TICK_INTERVAL_MS).map(String::as_str);
        let price_step = entries.get(ENGINE_PRICE_STEP).map(String::as_str);

        if tick_interval.is_none() && price_step.is_none() {
            return Ok(None);
        }

        parse_engine_config(tick_interval, price_step, EngineConfig::default())
            .map(Some)
            .ok_or_else(|| PricingError::Config("Malformed engine config entries".to_string()))
    }

    async fn save_engine_config(&self, config: &EngineConfig) -> Result<()> {
        self.put_config_entries(engine_config_entries(config)).await;
        Ok(())
    }
}

#[async_trait]
impl PriceStateStore for MemoryStore {
    async fn load_open_states(&self) -> Result<Vec<OpportunityPriceState>> {
        Ok(self.states.read().await.values().filter(|s| s.is_open()).cloned().collect())
    }

    async fn load_all_states(&self) -> Result<Vec<OpportunityPriceState>> {
        Ok(self.states.read().await.values().cloned().collect())
    }

    async fn find_state(&self, opportunity_id: OpportunityId) -> Result<Option<OpportunityPriceState>> {
        Ok(self.states.read().await.get(&opportunity_id).cloned())
    }

    async fn insert_state(&self, state: &OpportunityPriceState) -> Result<()> {
        let mut states = self.states.write().await;
        if states.contains_key(&state.opportunity_id) {
            return Err(PricingError::OpportunityExists(state.opportunity_id));
        }
        states.insert(state.opportunity_id, state.clone());
        Ok(())
    }

    async fn close_opportunity(&self, opportunity_id: OpportunityId, _at: DateTime<Utc>) -> Result<bool> {
        let mut states = self.states.write().await;
        match states.get_mut(&opportunity_id) {
            Some(state) if state.is_open() => {
                state.status = OpportunityStatus::Closed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_price(&self, commit: &PriceCommit) -> Result<bool> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(&commit.opportunity_id)
            .ok_or(PricingError::OpportunityNotFound(commit.opportunity_id))?;

        if !state.is_open() || state.current_price != commit.expected_price {
            return Ok(false);
        }

        state.current_price = commit.new_price;
        state.floor_price = commit.floor_price;
        state.cutoff_price = commit.cutoff_price;
        state.trend = commit.trend;
        state.last_price_update = commit.timestamp;
        Ok(true)
    }

    async fn update_bounds(&self, opportunity_id: OpportunityId, floor_price: f64, cutoff_price: f64) -> Result<bool> {
        let mut states = self.states.write().await;
        match states.get_mut(&opportunity_id) {
            Some(state) if state.is_open() => {
                state.floor_price = floor_price;
                state.cutoff_price = cutoff_price;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CalibrationStore for MemoryStore {
    async fn load_calibrations(&self) -> Result<HashMap<String, OutletCalibration>> {
        let entries = self.config_entries.read().await.clone();
        Ok(parse_calibrations(entries))
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn read_signal(
        &self,
        opportunity_id: OpportunityId,
        signal: Signal,
        _now: DateTime<Utc>,
    ) -> Result<SignalReading> {
        Ok(self
            .signals
            .read()
            .await
            .get(&(opportunity_id, signal))
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Tier, Trend};

    fn open_state(id: OpportunityId, price: f64) -> OpportunityPriceState {
        OpportunityPriceState {
            opportunity_id: id,
            outlet: "Forbes".to_string(),
            current_price: price,
            base_price: price,
            floor_price: 125.0,
            cutoff_price: 400.0,
            tier: Tier::Two,
            status: OpportunityStatus::Open,
            last_price_update: Utc::now(),
            trend: Trend::Stable,
        }
    }

    fn commit(id: OpportunityId, expected: f64, new_price: f64) -> PriceCommit {
        PriceCommit {
            opportunity_id: id,
            expected_price: expected,
            new_price,
            floor_price: 125.0,
            cutoff_price: 400.0,
            trend: Trend::from_move(expected, new_price),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_requires_expected_price() {
        let store = MemoryStore::new();
        store.insert_state(&open_state(1, 200.0)).await.unwrap();

        assert!(!store.commit_price(&commit(1, 199.0, 204.0)).await.unwrap());
        assert!(store.commit_price(&commit(1, 200.0, 205.0)).await.unwrap());

        let state = store.find_state(1).await.unwrap().unwrap();
        assert_eq!(state.current_price, 205.0);
        assert_eq!(state.trend, Trend::Up);
    }

    #[tokio::test]
    async fn test_closed_opportunity_refuses_commits() {
        let store = MemoryStore::new();
        store.insert_state(&open_state(1, 200.0)).await.unwrap();

        assert!(store.close_opportunity(1, Utc::now()).await.unwrap());
        assert!(!store.close_opportunity(1, Utc::now()).await.unwrap());
        assert!(!store.commit_price(&commit(1, 200.0, 205.0)).await.unwrap());
        assert!(store.load_open_states().await.unwrap().is_empty());
        assert_eq!(store.load_all_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let store = MemoryStore::new();
        store.insert_state(&open_state(3, 100.0)).await.unwrap();
        let err = store.insert_state(&open_state(3, 100.0)).await.unwrap_err();
        assert!(matches!(err, PricingError::OpportunityExists(3)));
    }

    #[tokio::test]
    async fn test_engine_config_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load_engine_config().await.unwrap(), None);

        let config = EngineConfig { tick_interval_ms: 120_000, price_step: 10.0 };
        store.save_engine_config(&config).await.unwrap();
        assert_eq!(store.load_engine_config().await.unwrap(), Some(config));
    }
}
