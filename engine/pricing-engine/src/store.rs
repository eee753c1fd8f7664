//! Storage traits consumed by the engine
//!
//! Every trait has a Postgres implementation (`PgPricingStore`) and an
//! in-memory one (`MemoryStore`) used by tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::models::{
    OpportunityId, OpportunityPriceState, OutletCalibration, PriceCommit, PricingVariable,
    SignalReading,
};
use crate::sampler::Signal;

/// Persistence of the variable registry
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn load_variables(&self) -> Result<Vec<PricingVariable>>;

    async fn find_variable(&self, name: &str) -> Result<Option<PricingVariable>>;

    async fn save_variable(&self, variable: &PricingVariable) -> Result<()>;
}

/// Persistence of the hot-reloadable engine config
#[async_trait]
pub trait EngineConfigStore: Send + Sync {
    /// `None` when no config has been saved yet
    async fn load_engine_config(&self) -> Result<Option<EngineConfig>>;

    async fn save_engine_config(&self, config: &EngineConfig) -> Result<()>;
}

/// Opportunity price states. `commit_price` is the only path that changes
/// `current_price`.
#[async_trait]
pub trait PriceStateStore: Send + Sync {
    async fn load_open_states(&self) -> Result<Vec<OpportunityPriceState>>;

    async fn load_all_states(&self) -> Result<Vec<OpportunityPriceState>>;

    async fn find_state(&self, opportunity_id: OpportunityId) -> Result<Option<OpportunityPriceState>>;

    /// Fails with `OpportunityExists` if a state is already present
    async fn insert_state(&self, state: &OpportunityPriceState) -> Result<()>;

    /// Returns false if the opportunity was unknown or already closed
    async fn close_opportunity(&self, opportunity_id: OpportunityId, at: DateTime<Utc>) -> Result<bool>;

    /// Returns false if the opportunity is closed or its price no longer
    /// matches `commit.expected_price`
    async fn commit_price(&self, commit: &PriceCommit) -> Result<bool>;

    /// Record new effective bounds without touching the price. Returns false
    /// if the opportunity is unknown or closed.
    async fn update_bounds(&self, opportunity_id: OpportunityId, floor_price: f64, cutoff_price: f64)
        -> Result<bool>;
}

/// Read side of the outlet calibration table
#[async_trait]
pub trait CalibrationStore: Send + Sync {
    async fn load_calibrations(&self) -> Result<HashMap<String, OutletCalibration>>;
}

/// Read-only access to opportunity activity records
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn read_signal(
        &self,
        opportunity_id: OpportunityId,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> Result<SignalReading>;
}

/// The set of stores an engine is built from
#[derive(Clone)]
pub struct PricingStores {
    pub variables: Arc<dyn VariableStore>,
    pub engine_config: Arc<dyn EngineConfigStore>,
    pub states: Arc<dyn PriceStateStore>,
    pub calibrations: Arc<dyn CalibrationStore>,
    pub activity: Arc<dyn ActivityStore>,
}

impl PricingStores {
    /// Use one backend for every store
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: VariableStore
            + EngineConfigStore
            + PriceStateStore
            + CalibrationStore
            + ActivityStore
            + 'static,
    {
        Self {
            variables: store.clone(),
            engine_config: store.clone(),
            states: store.clone(),
            calibrations: store.clone(),
            activity: store,
        }
    }
}

/// Read the stored engine config, falling back to `fallback` when none is saved
pub async fn load_engine_config_or(
    store: &dyn EngineConfigStore,
    fallback: EngineConfig,
) -> Result<EngineConfig> {
    Ok(store.load_engine_config().await?.unwrap_or(fallback))
}
