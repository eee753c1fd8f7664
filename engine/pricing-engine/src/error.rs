//! Error types for the pricing engine

use crate::models::OpportunityId;
use std::time::Duration;
use thiserror::Error;

/// Result type for pricing engine operations
pub type Result<T> = std::result::Result<T, PricingError>;

/// Errors that can occur in the pricing engine
#[derive(Error, Debug)]
pub enum PricingError {
    /// Rejected admin input (variable weight/transform, engine config range)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Sampling failed for opportunity {opportunity_id}: {reason}")]
    Sampling { opportunity_id: OpportunityId, reason: String },

    #[error("Opportunity {0} not found")]
    OpportunityNotFound(OpportunityId),

    #[error("Opportunity {0} already has a price state")]
    OpportunityExists(OpportunityId),

    #[error("Opportunity {0} timed out after {1:?}")]
    Timeout(OpportunityId, Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PricingError {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new sampling error for one opportunity
    pub fn sampling(opportunity_id: OpportunityId, reason: impl Into<String>) -> Self {
        Self::Sampling { opportunity_id, reason: reason.into() }
    }

    /// Whether this error should be surfaced to the admin caller
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<String> for PricingError {
    fn from(err: String) -> Self {
        PricingError::Internal(err)
    }
}
