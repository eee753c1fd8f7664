//! Outlet calibration job
//!
//! Weekly, derives per-outlet floor, ceiling, average and confidence from the
//! trailing window of winning bids and writes them to the shared
//! `system_config` table, where the pricing engine picks them up at its next
//! tick. Runs as its own process; the config table is the only coupling.

pub mod calibrator;
pub mod cli;
pub mod config;
pub mod error;
pub mod postgres;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use calibrator::{CalibrationReport, Calibrator, OutletReport, SkippedOutlet};
pub use config::{CalibrationConfig, CalibrationParams, ScheduleConfig};
pub use error::{CalibrationError, Result};
pub use postgres::PgCalibrationStore;
pub use scheduler::{next_run_after, CalibrationScheduler};
pub use stats::PriceStats;
pub use store::{CalibrationSink, MemoryCalibrationStore, OutcomeStore, WinningBid};
