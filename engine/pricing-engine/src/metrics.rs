//! Metrics collection for the pricing engine
//!
//! Counters are kept locally for the admin surface and mirrored to the
//! `metrics` facade so an installed Prometheus recorder picks them up.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::models::TickReport;

pub const TICKS_TOTAL: &str = "pricing_ticks_total";
pub const TICKS_SKIPPED_TOTAL: &str = "pricing_ticks_skipped_total";
pub const TICK_DURATION_SECONDS: &str = "pricing_tick_duration_seconds";
pub const PRICE_UPDATES_TOTAL: &str = "pricing_price_updates_total";
pub const OPPORTUNITY_FAILURES_TOTAL: &str = "pricing_opportunity_failures_total";
pub const OPEN_OPPORTUNITIES: &str = "pricing_open_opportunities";
pub const BROADCAST_FAILURES_TOTAL: &str = "pricing_broadcast_failures_total";

/// Point-in-time view of the engine counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub last_tick_seq: u64,
    pub last_tick_duration_ms: u64,
    pub max_tick_duration_ms: u64,
    pub open_opportunities: u64,
    pub total_ticks: u64,
    pub skipped_ticks: u64,
    pub total_price_updates: u64,
    pub total_opportunity_failures: u64,
    pub total_broadcast_failures: u64,
    pub uptime_seconds: u64,
}

pub struct MetricsCollector {
    last_tick_seq: AtomicU64,
    last_tick_duration_ms: AtomicU64,
    max_tick_duration_ms: AtomicU64,
    open_opportunities: AtomicU64,
    total_ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    total_price_updates: AtomicU64,
    total_opportunity_failures: AtomicU64,
    total_broadcast_failures: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            last_tick_seq: AtomicU64::new(0),
            last_tick_duration_ms: AtomicU64::new(0),
            max_tick_duration_ms: AtomicU64::new(0),
            open_opportunities: AtomicU64::new(0),
            total_ticks: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            total_price_updates: AtomicU64::new(0),
            total_opportunity_failures: AtomicU64::new(0),
            total_broadcast_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a completed tick
    pub fn record_tick(&self, report: &TickReport) {
        let duration_ms = report.duration.as_millis() as u64;

        self.last_tick_seq.store(report.tick_seq, Ordering::Relaxed);
        self.last_tick_duration_ms.store(duration_ms, Ordering::Relaxed);
        self.max_tick_duration_ms.fetch_max(duration_ms, Ordering::Relaxed);
        self.open_opportunities.store(report.processed as u64, Ordering::Relaxed);
        self.total_ticks.fetch_add(1, Ordering::Relaxed);
        self.total_price_updates.fetch_add(report.updated as u64, Ordering::Relaxed);
        self.total_opportunity_failures.fetch_add(report.failed as u64, Ordering::Relaxed);

        metrics::increment_counter!(TICKS_TOTAL);
        metrics::counter!(PRICE_UPDATES_TOTAL, report.updated as u64);
        metrics::counter!(OPPORTUNITY_FAILURES_TOTAL, report.failed as u64);
        metrics::gauge!(OPEN_OPPORTUNITIES, report.processed as f64);
        metrics::histogram!(TICK_DURATION_SECONDS, report.duration.as_secs_f64());
    }

    /// Record a tick skipped because the previous one was still running
    pub fn record_skipped_tick(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!(TICKS_SKIPPED_TOTAL);
    }

    /// Record a batch the broadcast queue did not accept
    pub fn record_broadcast_failure(&self) {
        self.total_broadcast_failures.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!(BROADCAST_FAILURES_TOTAL);
    }

    pub fn snapshot(&self) -> EngineMetrics {
        EngineMetrics {
            last_tick_seq: self.last_tick_seq.load(Ordering::Relaxed),
            last_tick_duration_ms: self.last_tick_duration_ms.load(Ordering::Relaxed),
            max_tick_duration_ms: self.max_tick_duration_ms.load(Ordering::Relaxed),
            open_opportunities: self.open_opportunities.load(Ordering::Relaxed),
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            total_price_updates: self.total_price_updates.load(Ordering::Relaxed),
            total_opportunity_failures: self.total_opportunity_failures.load(Ordering::Relaxed),
            total_broadcast_failures: self.total_broadcast_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}
