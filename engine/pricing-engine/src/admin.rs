//! Admin surface for pricing variables and the engine config

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::models::PricingVariable;
use crate::registry::{VariableRegistry, VariableUpdate};
use crate::store::{load_engine_config_or, EngineConfigStore, VariableStore};

/// Partial engine config update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigUpdate {
    pub tick_interval_ms: Option<u64>,
    pub price_step: Option<f64>,
}

pub struct AdminService {
    registry: VariableRegistry,
    engine_config: Arc<dyn EngineConfigStore>,
    fallback: EngineConfig,
}

impl AdminService {
    pub fn new(
        variables: Arc<dyn VariableStore>,
        engine_config: Arc<dyn EngineConfigStore>,
        fallback: EngineConfig,
    ) -> Self {
        Self { registry: VariableRegistry::new(variables), engine_config, fallback }
    }

    pub async fn list_variables(&self) -> Result<Vec<PricingVariable>> {
        self.registry.get_all().await
    }

    pub async fn upsert_variable(&self, name: &str, update: VariableUpdate) -> Result<PricingVariable> {
        self.registry.upsert(name, update).await
    }

    pub async fn engine_config(&self) -> Result<EngineConfig> {
        load_engine_config_or(self.engine_config.as_ref(), self.fallback).await
    }

    /// Merge `update` into the stored config. Out-of-range values are rejected
    /// and nothing is written; the engine picks the change up at its next tick.
    pub async fn update_engine_config(&self, update: EngineConfigUpdate) -> Result<EngineConfig> {
        let mut config = self.engine_config().await?;
        if let Some(tick_interval_ms) = update.tick_interval_ms {
            config.tick_interval_ms = tick_interval_ms;
        }
        if let Some(price_step) = update.price_step {
            config.price_step = price_step;
        }

        config.validate()?;
        self.engine_config.save_engine_config(&config).await?;

        info!(
            "Engine config updated: tick interval {} ms, price step {}",
            config.tick_interval_ms, config.price_step
        );
        Ok(config)
    }
}
