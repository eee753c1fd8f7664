use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::TierDefaults;
use crate::error::{PricingError, Result};
use crate::models::{
    OpportunityPriceState, OutletCalibration, PricingVariable, SignalReading, TransformContext, Trend,
};
use crate::registry::apply_transform;

/// Where the effective bounds of a tick came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsSource {
    TierDefault,
    Calibrated,
}

/// Effective floor and ceiling for one opportunity in one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBounds {
    pub floor_price: f64,
    pub cutoff_price: f64,
    pub source: BoundsSource,
}

impl PriceBounds {
    pub fn clamp(&self, price: f64) -> f64 {
        price.max(self.floor_price).min(self.cutoff_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceDecision {
    Unchanged,
    Update { new_price: f64, trend: Trend },
}

/// Price calculator for the weighted-signal model
pub struct PriceCalculator {
    tiers: TierDefaults,
    confidence_threshold: f64,
}

impl PriceCalculator {
    /// Create a new price calculator
    pub fn new(tiers: TierDefaults, confidence_threshold: f64) -> Self {
        Self { tiers, confidence_threshold }
    }

    /// Sum of `weight * transform(raw)` over all variables.
    ///
    /// Variables without a reading contribute 0. Each term saturates at
    /// `±f64::MAX`, so an overflowing score is infinite but never NaN.
    pub fn score(variables: &[PricingVariable], readings: &HashMap<String, SignalReading>) -> f64 {
        variables
            .iter()
            .map(|variable| {
                let reading = readings.get(&variable.name).copied().unwrap_or_default();
                let context = TransformContext { age_hours: reading.age_hours };
                let term = variable.weight * apply_transform(variable.nonlinear_fn, reading.value, &context);
                term.clamp(f64::MIN, f64::MAX)
            })
            .fold(0.0, |total, term| total + term)
    }

    /// Limit a score to `[-price_step, +price_step]`
    pub fn clamp_delta(score: f64, price_step: f64) -> f64 {
        score.clamp(-price_step, price_step)
    }

    /// Bounds for this opportunity: the outlet calibration when it is confident
    /// enough, otherwise the tier defaults.
    pub fn resolve_bounds(
        &self,
        state: &OpportunityPriceState,
        calibration: Option<&OutletCalibration>,
    ) -> PriceBounds {
        let defaults = self.tiers.for_tier(state.tier);

        let (floor_price, cutoff_price, source) = match calibration {
            Some(calibration) if calibration.confidence_score >= self.confidence_threshold => (
                calibration.recommended_floor,
                calibration.recommended_ceiling,
                BoundsSource::Calibrated,
            ),
            Some(calibration) => {
                debug!(
                    "Calibration for outlet {} has confidence {:.2} below threshold {:.2}, using tier defaults",
                    calibration.outlet, calibration.confidence_score, self.confidence_threshold
                );
                (defaults.floor_price, defaults.cutoff_price, BoundsSource::TierDefault)
            }
            None => (defaults.floor_price, defaults.cutoff_price, BoundsSource::TierDefault),
        };

        if floor_price > cutoff_price {
            warn!(
                "Inconsistent bounds for opportunity {} (outlet {}): floor {} > cutoff {}, pinning to floor",
                state.opportunity_id, state.outlet, floor_price, cutoff_price
            );
            return PriceBounds { floor_price, cutoff_price: floor_price, source };
        }

        PriceBounds { floor_price, cutoff_price, source }
    }

    /// Decide the next price for one opportunity
    pub fn decide(
        &self,
        state: &OpportunityPriceState,
        score: f64,
        price_step: f64,
        bounds: &PriceBounds,
    ) -> Result<PriceDecision> {
        if score.is_nan() {
            return Err(PricingError::sampling(state.opportunity_id, "score is NaN"));
        }

        let delta = Self::clamp_delta(score, price_step);
        let new_price = bounds.clamp(state.current_price + delta);

        if new_price == state.current_price {
            return Ok(PriceDecision::Unchanged);
        }

        Ok(PriceDecision::Update {
            new_price,
            trend: Trend::from_move(state.current_price, new_price),
        })
    }
}
