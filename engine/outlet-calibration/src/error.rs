//! Error types for the calibration job

use pricing_engine::PricingError;
use thiserror::Error;

/// Result type for calibration operations
pub type Result<T> = std::result::Result<T, CalibrationError>;

/// A failed calibration run. Any of these aborts the run before anything is
/// written.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid outcome for outlet {outlet}: {reason}")]
    InvalidOutcome { outlet: String, reason: String },
}
