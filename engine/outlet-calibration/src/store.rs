//! Storage seams of the calibration job

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricing_engine::config_keys::{calibration_entries, LAST_OUTLET_CALIBRATION};
use pricing_engine::OutletCalibration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::error::Result;

/// One winning bid, attributed to the outlet of its opportunity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinningBid {
    pub outlet: String,
    pub amount: f64,
    pub decided_at: DateTime<Utc>,
}

/// Read side: winning bids decided within `[since, until)`
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn winning_bids(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<WinningBid>>;
}

/// Write side: persists a whole run or nothing
#[async_trait]
pub trait CalibrationSink: Send + Sync {
    async fn write_calibrations(&self, calibrations: &[OutletCalibration], ran_at: DateTime<Utc>) -> Result<()>;
}

/// Config rows written for one run, `lastOutletCalibration` included
pub fn run_entries(calibrations: &[OutletCalibration], ran_at: DateTime<Utc>) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = calibrations.iter().flat_map(calibration_entries).collect();
    entries.push((LAST_OUTLET_CALIBRATION.to_string(), ran_at.to_rfc3339()));
    entries
}

/// In-memory outcome store and config table
#[derive(Default)]
pub struct MemoryCalibrationStore {
    bids: RwLock<Vec<WinningBid>>,
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_bid(&self, outlet: &str, amount: f64, decided_at: DateTime<Utc>) {
        self.bids.write().await.push(WinningBid { outlet: outlet.to_string(), amount, decided_at });
    }

    pub async fn entries(&self) -> BTreeMap<String, String> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl OutcomeStore for MemoryCalibrationStore {
    async fn winning_bids(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<WinningBid>> {
        Ok(self
            .bids
            .read()
            .await
            .iter()
            .filter(|bid| bid.decided_at >= since && bid.decided_at < until)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CalibrationSink for MemoryCalibrationStore {
    async fn write_calibrations(&self, calibrations: &[OutletCalibration], ran_at: DateTime<Utc>) -> Result<()> {
        let rows = run_entries(calibrations, ran_at);
        let mut entries = self.entries.write().await;
        entries.extend(rows);
        Ok(())
    }
}
