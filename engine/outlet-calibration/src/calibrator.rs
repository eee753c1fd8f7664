//! Outlet calibration: per-outlet floor, ceiling and confidence from the
//! trailing window of winning bids.
//!
//! A run is a pure function of the winning bids and `now`; running it twice
//! over the same window produces the same calibrations.

use chrono::{DateTime, Duration, Utc};
use pricing_engine::OutletCalibration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::CalibrationParams;
use crate::error::{CalibrationError, Result};
use crate::stats::PriceStats;
use crate::store::{CalibrationSink, OutcomeStore, WinningBid};

/// Sample count at which the size half of the confidence score saturates
pub const FULL_CONFIDENCE_SAMPLES: f64 = 10.0;

/// One calibrated outlet with the statistics it was derived from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletReport {
    pub calibration: OutletCalibration,
    pub stats: PriceStats,
}

/// An outlet left uncalibrated for lack of samples
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedOutlet {
    pub outlet: String,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub dry_run: bool,
    /// Sorted by outlet name
    pub outlets: Vec<OutletReport>,
    pub skipped: Vec<SkippedOutlet>,
}

impl CalibrationReport {
    pub fn calibrations(&self) -> Vec<OutletCalibration> {
        self.outlets.iter().map(|report| report.calibration.clone()).collect()
    }
}

pub struct Calibrator {
    params: CalibrationParams,
}

impl Calibrator {
    pub fn new(params: CalibrationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    /// `[now - window_days, now)`
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - Duration::days(i64::from(self.params.window_days)), now)
    }

    /// Load the window, calibrate and, unless `dry_run`, persist every
    /// calibration in one write. Any failure aborts with nothing written.
    pub async fn run(
        &self,
        outcomes: &dyn OutcomeStore,
        sink: &dyn CalibrationSink,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<CalibrationReport> {
        let (window_start, window_end) = self.window(now);
        info!("Calibrating outlets from winning bids between {} and {}", window_start, window_end);

        let bids = outcomes.winning_bids(window_start, window_end).await?;
        let (outlets, skipped) = self.calibrate(&bids, now)?;

        let report = CalibrationReport { window_start, window_end, dry_run, outlets, skipped };

        if dry_run {
            info!("Dry run: {} outlets calibrated, nothing written", report.outlets.len());
        } else {
            sink.write_calibrations(&report.calibrations(), now).await?;
            info!(
                "Calibration written for {} outlets ({} skipped)",
                report.outlets.len(),
                report.skipped.len()
            );
        }

        Ok(report)
    }

    /// Group bids by outlet and calibrate every outlet with enough samples
    pub fn calibrate(
        &self,
        bids: &[WinningBid],
        now: DateTime<Utc>,
    ) -> Result<(Vec<OutletReport>, Vec<SkippedOutlet>)> {
        let mut by_outlet: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for bid in bids {
            if !bid.amount.is_finite() || bid.amount < 0.0 {
                return Err(CalibrationError::InvalidOutcome {
                    outlet: bid.outlet.clone(),
                    reason: format!("winning bid amount {}", bid.amount),
                });
            }
            by_outlet.entry(bid.outlet.as_str()).or_default().push(bid.amount);
        }

        let mut reports = Vec::new();
        let mut skipped = Vec::new();

        for (outlet, amounts) in by_outlet {
            if amounts.len() < self.params.min_sample_size {
                debug!(
                    "Skipping outlet {}: {} samples, {} required",
                    outlet,
                    amounts.len(),
                    self.params.min_sample_size
                );
                skipped.push(SkippedOutlet { outlet: outlet.to_string(), sample_size: amounts.len() });
                continue;
            }

            let Some(stats) = PriceStats::compute(&amounts) else {
                continue;
            };
            let calibration = self.calibrate_outlet(outlet, &stats, now);
            reports.push(OutletReport { calibration, stats });
        }

        Ok((reports, skipped))
    }

    pub fn calibrate_outlet(&self, outlet: &str, stats: &PriceStats, now: DateTime<Utc>) -> OutletCalibration {
        let floor = (0.75 * stats.q1)
            .max(0.9 * stats.min)
            .max(self.params.absolute_minimum)
            .min(self.params.absolute_maximum);
        let mut ceiling = (1.25 * stats.q3).min(1.1 * stats.max).min(self.params.absolute_maximum);

        if ceiling < floor {
            warn!(
                "Outlet {}: ceiling {:.2} below floor {:.2}, raising ceiling to the floor",
                outlet, ceiling, floor
            );
            ceiling = floor;
        }

        OutletCalibration {
            outlet: outlet.to_string(),
            avg_price: stats.mean,
            recommended_floor: floor,
            recommended_ceiling: ceiling,
            confidence_score: confidence_score(stats),
            sample_size: u32::try_from(stats.count).unwrap_or(u32::MAX),
            last_calibration: now,
        }
    }
}

/// Half sample size, half price dispersion, clamped to [0, 1]
pub fn confidence_score(stats: &PriceStats) -> f64 {
    let size = (stats.count as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0);
    let consistency = if stats.mean > 0.0 { (1.0 - stats.stddev / stats.mean).max(0.0) } else { 0.0 };
    (0.5 * size + 0.5 * consistency).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCalibrationStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FailingSink;

    #[async_trait]
    impl CalibrationSink for FailingSink {
        async fn write_calibrations(&self, _: &[OutletCalibration], _: DateTime<Utc>) -> Result<()> {
            Err(CalibrationError::Config("sink unavailable".to_string()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap()
    }

    async fn store_with(outlet: &str, amounts: &[f64]) -> MemoryCalibrationStore {
        let store = MemoryCalibrationStore::new();
        for (i, amount) in amounts.iter().enumerate() {
            store.add_bid(outlet, *amount, now() - Duration::days(i as i64 + 1)).await;
        }
        store
    }

    fn calibrator() -> Calibrator {
        Calibrator::new(CalibrationParams::default())
    }

    #[tokio::test]
    async fn test_quartile_bounds() {
        let store = store_with("Wired", &[100.0, 120.0, 140.0, 160.0, 300.0]).await;
        let report = calibrator().run(&store, &store, now(), false).await.unwrap();

        assert_eq!(report.outlets.len(), 1);
        let calibration = &report.outlets[0].calibration;
        assert_eq!(calibration.recommended_floor, 90.0);
        assert_eq!(calibration.recommended_ceiling, 200.0);
        assert_eq!(calibration.avg_price, 164.0);
        assert_eq!(calibration.sample_size, 5);
        assert!((calibration.confidence_score - 0.508_395).abs() < 1e-4);

        let entries = store.entries().await;
        assert_eq!(entries["outlet.Wired.recommendedFloor"], "90");
        assert_eq!(entries["outlet.Wired.recommendedCeiling"], "200");
        assert!(entries.contains_key("lastOutletCalibration"));
    }

    #[tokio::test]
    async fn test_rerun_is_identical() {
        let store = store_with("Wired", &[100.0, 120.0, 140.0, 160.0, 300.0]).await;
        for (i, amount) in [80.0, 95.0, 110.0, 125.0, 140.0, 155.0].iter().enumerate() {
            store.add_bid("Forbes", *amount, now() - Duration::hours(i as i64 + 1)).await;
        }

        let first = calibrator().run(&store, &store, now(), false).await.unwrap();
        let entries_after_first = store.entries().await;
        let second = calibrator().run(&store, &store, now(), false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(entries_after_first, store.entries().await);
        let outlets: Vec<&str> = first.outlets.iter().map(|r| r.calibration.outlet.as_str()).collect();
        assert_eq!(outlets, vec!["Forbes", "Wired"]);
    }

    #[tokio::test]
    async fn test_outlet_below_min_samples_is_skipped() {
        let store = store_with("Wired", &[100.0, 120.0, 140.0]).await;
        let report = calibrator().run(&store, &store, now(), false).await.unwrap();

        assert!(report.outlets.is_empty());
        assert_eq!(report.skipped, vec![SkippedOutlet { outlet: "Wired".to_string(), sample_size: 3 }]);
        assert!(!store.entries().await.keys().any(|key| key.starts_with("outlet.Wired")));
    }

    #[tokio::test]
    async fn test_bids_outside_window_are_ignored() {
        let store = store_with("Wired", &[100.0, 120.0, 140.0, 160.0]).await;
        store.add_bid("Wired", 300.0, now() - Duration::days(91)).await;
        store.add_bid("Wired", 300.0, now()).await;

        let report = calibrator().run(&store, &store, now(), true).await.unwrap();
        assert!(report.outlets.is_empty());
        assert_eq!(report.skipped[0].sample_size, 4);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = store_with("Wired", &[100.0, 120.0, 140.0, 160.0, 300.0]).await;
        let report = calibrator().run(&store, &store, now(), true).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.outlets.len(), 1);
        assert!(store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_aborts_run() {
        let store = store_with("Wired", &[100.0, 120.0, 140.0, 160.0, 300.0]).await;
        tokio_test::assert_err!(calibrator().run(&store, &FailingSink, now(), false).await);
    }

    #[tokio::test]
    async fn test_invalid_amount_aborts_run() {
        let store = store_with("Wired", &[100.0, 120.0, 140.0, 160.0, f64::NAN]).await;
        let result = calibrator().run(&store, &store, now(), false).await;
        assert!(matches!(result, Err(CalibrationError::InvalidOutcome { .. })));
        assert!(store.entries().await.is_empty());
    }

    #[test]
    fn test_absolute_limits_apply() {
        let stats = PriceStats::compute(&[4.0, 5.0, 5.0, 6.0, 6.0]).unwrap();
        let calibration = calibrator().calibrate_outlet("Tiny", &stats, now());
        assert_eq!(calibration.recommended_floor, 10.0);
        assert_eq!(calibration.recommended_ceiling, 10.0);

        let stats = PriceStats::compute(&[20_000.0, 30_000.0, 40_000.0]).unwrap();
        let calibration = calibrator().calibrate_outlet("Huge", &stats, now());
        assert_eq!(calibration.recommended_floor, 10_000.0);
        assert_eq!(calibration.recommended_ceiling, 10_000.0);
    }

    #[test]
    fn test_confidence_score_range() {
        let uniform = PriceStats::compute(&[200.0; 12]).unwrap();
        assert_eq!(confidence_score(&uniform), 1.0);

        let spread = PriceStats::compute(&[1.0, 1.0, 1_000.0]).unwrap();
        let score = confidence_score(&spread);
        assert!((0.0..=1.0).contains(&score));
        assert!((score - 0.15).abs() < 1e-9);
    }
}
