//! Error types for the PriceGateway

use pricing_engine::PricingError;
use thiserror::Error;

/// Errors that can occur in the PriceGateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("System error: {0}")]
    System(String),
}

impl GatewayError {
    /// Numeric code sent in `error` stream messages
    pub fn code(&self) -> u32 {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::Serialization(_) => 40000,
            GatewayError::UnknownMethod(_) => 40400,
            GatewayError::Pricing(e) if e.is_validation() => 40000,
            GatewayError::Pricing(PricingError::OpportunityNotFound(_)) => 40401,
            _ => 50000,
        }
    }
}

impl From<String> for GatewayError {
    fn from(err: String) -> Self {
        GatewayError::System(err)
    }
}

/// Result type for PriceGateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
