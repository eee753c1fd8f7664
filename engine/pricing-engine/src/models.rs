use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PricingError;

/// Opportunity identifier as stored by the opportunity store
pub type OpportunityId = i64;

/// Monotonically increasing tick sequence number
pub type TickSeq = u64;

/// Nonlinear transform applied to a raw signal before weighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NonlinearFn {
    #[default]
    #[serde(rename = "none")]
    None,
    /// Exponential decay with a 24 hour half-life
    #[serde(rename = "decay24h")]
    Decay24h,
}

impl NonlinearFn {
    pub fn as_str(&self) -> &'static str {
        match self {
            NonlinearFn::None => "none",
            NonlinearFn::Decay24h => "decay24h",
        }
    }
}

impl FromStr for NonlinearFn {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(NonlinearFn::None),
            "decay24h" => Ok(NonlinearFn::Decay24h),
            other => Err(PricingError::validation(format!("Unknown nonlinear transform: {other}"))),
        }
    }
}

impl fmt::Display for NonlinearFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named pricing signal with its weight and transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingVariable {
    pub name: String,
    pub weight: f64,
    pub nonlinear_fn: NonlinearFn,
    pub updated_at: DateTime<Utc>,
}

impl PricingVariable {
    pub fn new(name: impl Into<String>, weight: f64, nonlinear_fn: NonlinearFn) -> Self {
        Self { name: name.into(), weight, nonlinear_fn, updated_at: Utc::now() }
    }
}

/// Outlet prestige tier; sets default price bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    One,
    Two,
    Three,
}

impl TryFrom<u8> for Tier {
    type Error = PricingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::One),
            2 => Ok(Tier::Two),
            3 => Ok(Tier::Three),
            other => Err(PricingError::validation(format!("Invalid tier: {other}"))),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::One => 1,
            Tier::Two => 2,
            Tier::Three => 3,
        }
    }
}

/// Direction of the last committed price move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Stable,
}

impl Trend {
    pub fn from_move(old_price: f64, new_price: f64) -> Self {
        if new_price > old_price {
            Trend::Up
        } else if new_price < old_price {
            Trend::Down
        } else {
            Trend::Stable
        }
    }

    pub fn sign(&self) -> i8 {
        match self {
            Trend::Up => 1,
            Trend::Down => -1,
            Trend::Stable => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Up => "up",
            Trend::Down => "down",
            Trend::Stable => "stable",
        }
    }
}

impl FromStr for Trend {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Trend::Up),
            "down" => Ok(Trend::Down),
            "stable" => Ok(Trend::Stable),
            other => Err(PricingError::Internal(format!("Unknown trend: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Open,
    Closed,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::Open => "open",
            OpportunityStatus::Closed => "closed",
        }
    }
}

impl FromStr for OpportunityStatus {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OpportunityStatus::Open),
            "closed" => Ok(OpportunityStatus::Closed),
            other => Err(PricingError::Internal(format!("Unknown opportunity status: {other}"))),
        }
    }
}

/// Authoritative price state of one opportunity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityPriceState {
    pub opportunity_id: OpportunityId,
    pub outlet: String,
    pub current_price: f64,
    pub base_price: f64,
    pub floor_price: f64,
    /// Price ceiling
    pub cutoff_price: f64,
    pub tier: Tier,
    pub status: OpportunityStatus,
    pub last_price_update: DateTime<Utc>,
    pub trend: Trend,
}

impl OpportunityPriceState {
    pub fn is_open(&self) -> bool {
        self.status == OpportunityStatus::Open
    }
}

/// Statistically derived price bounds for one outlet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletCalibration {
    pub outlet: String,
    pub avg_price: f64,
    pub recommended_floor: f64,
    pub recommended_ceiling: f64,
    /// In [0, 1]
    pub confidence_score: f64,
    pub sample_size: u32,
    pub last_calibration: DateTime<Utc>,
}

/// Where a price update originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Scheduler,
}

/// A committed price change, consumed once by the broadcast layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdateEvent {
    pub opportunity_id: OpportunityId,
    pub old_price: f64,
    pub new_price: f64,
    pub trend_sign: i8,
    pub timestamp: DateTime<Utc>,
    pub source: PriceSource,
    pub tick_seq: TickSeq,
}

/// All events committed by one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBatch {
    pub tick_seq: TickSeq,
    pub events: Vec<PriceUpdateEvent>,
}

/// Full view of open prices as of the last completed tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub tick_seq: TickSeq,
    pub taken_at: DateTime<Utc>,
    pub prices: Vec<OpportunityPriceState>,
}

/// Current value of one signal plus the age of its newest underlying event
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalReading {
    pub value: f64,
    pub age_hours: f64,
}

impl SignalReading {
    pub fn new(value: f64, age_hours: f64) -> Self {
        Self { value, age_hours }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

/// Inputs available to a nonlinear transform
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransformContext {
    pub age_hours: f64,
}

/// A single-writer price commit issued by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct PriceCommit {
    pub opportunity_id: OpportunityId,
    /// Price the engine read at tick start; the commit is refused if it changed
    pub expected_price: f64,
    pub new_price: f64,
    pub floor_price: f64,
    pub cutoff_price: f64,
    pub trend: Trend,
    pub timestamp: DateTime<Utc>,
}

/// Summary of one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick_seq: TickSeq,
    pub processed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub duration: Duration,
}
