//! Dynamic pricing engine
//!
//! Recomputes the market price of every open media-placement opportunity on a
//! fixed tick. Each tick samples the registered pricing signals, weights and
//! transforms them into a score, limits the move to the configured price step
//! and clamps the result into the opportunity's floor/cutoff bounds (tier
//! defaults, or the outlet calibration when it is confident enough).
//!
//! Committed changes are handed to the broadcast layer as `PriceBatch`es
//! through a bounded queue.

pub mod admin;
pub mod calculator;
pub mod config;
pub mod config_keys;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod registry;
pub mod sampler;
pub mod scheduler;
pub mod store;

pub use crate::admin::{AdminService, EngineConfigUpdate};
pub use crate::calculator::{BoundsSource, PriceBounds, PriceCalculator, PriceDecision};
pub use crate::config::{DatabaseConfig, EngineConfig, PricingConfig, TierBounds, TierDefaults};
pub use crate::engine::{PriceQuery, PricingEngine, TickContext};
pub use crate::error::{PricingError, Result};
pub use crate::memory::MemoryStore;
pub use crate::metrics::{EngineMetrics, MetricsCollector};
pub use crate::models::*;
pub use crate::postgres::PgPricingStore;
pub use crate::registry::{apply_transform, VariableRegistry, VariableUpdate};
pub use crate::sampler::{Signal, SignalSampler};
pub use crate::scheduler::TickScheduler;
pub use crate::store::PricingStores;
