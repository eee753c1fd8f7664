//! Variable registry: named pricing signals with mutable weights and transforms

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{PricingError, Result};
use crate::models::{NonlinearFn, PricingVariable, TransformContext};
use crate::store::VariableStore;

/// Half-life of the `decay24h` transform in hours
pub const DECAY_HALF_LIFE_HOURS: f64 = 24.0;

/// Partial update accepted by `VariableRegistry::upsert`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableUpdate {
    pub weight: Option<f64>,
    /// Transform identifier (`none` or `decay24h`)
    pub nonlinear_fn: Option<String>,
}

pub struct VariableRegistry {
    store: Arc<dyn VariableStore>,
}

impl VariableRegistry {
    pub fn new(store: Arc<dyn VariableStore>) -> Self {
        Self { store }
    }

    /// Current snapshot of all variables, sorted by name. Always reads the store.
    pub async fn get_all(&self) -> Result<Vec<PricingVariable>> {
        let mut variables = self.store.load_variables().await?;
        variables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(variables)
    }

    /// Create or partially update a variable.
    ///
    /// A new variable without a weight starts at 0. Fails with a validation
    /// error for an empty name, a non-finite weight or an unknown transform.
    pub async fn upsert(&self, name: &str, update: VariableUpdate) -> Result<PricingVariable> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PricingError::validation("Variable name must not be empty"));
        }

        if let Some(weight) = update.weight {
            if !weight.is_finite() {
                return Err(PricingError::validation(format!(
                    "Weight for {name} must be finite, got {weight}"
                )));
            }
        }

        let nonlinear_fn = update
            .nonlinear_fn
            .as_deref()
            .map(str::parse::<NonlinearFn>)
            .transpose()?;

        let mut variable = self
            .store
            .find_variable(name)
            .await?
            .unwrap_or_else(|| PricingVariable::new(name, 0.0, NonlinearFn::None));

        if let Some(weight) = update.weight {
            variable.weight = weight;
        }
        if let Some(nonlinear_fn) = nonlinear_fn {
            variable.nonlinear_fn = nonlinear_fn;
        }
        variable.updated_at = Utc::now();

        self.store.save_variable(&variable).await?;

        info!(
            "Upserted pricing variable {} (weight: {}, transform: {})",
            variable.name, variable.weight, variable.nonlinear_fn
        );

        Ok(variable)
    }
}

/// Apply a nonlinear transform to a raw signal value.
///
/// The result is always finite and lies between 0 and `raw_value`.
pub fn apply_transform(nonlinear_fn: NonlinearFn, raw_value: f64, context: &TransformContext) -> f64 {
    if !raw_value.is_finite() {
        return 0.0;
    }

    let transformed = match nonlinear_fn {
        NonlinearFn::None => raw_value,
        NonlinearFn::Decay24h => {
            let age_hours = if context.age_hours.is_nan() { 0.0 } else { context.age_hours.max(0.0) };
            raw_value * 0.5_f64.powf(age_hours / DECAY_HALF_LIFE_HOURS)
        }
    };

    let (low, high) = if raw_value >= 0.0 { (0.0, raw_value) } else { (raw_value, 0.0) };
    if transformed.is_nan() {
        return 0.0;
    }
    transformed.clamp(low, high)
}
