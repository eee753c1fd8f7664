//! PriceGateway - WebSocket price feed and REST API for the pricing engine
//!
//! Pushes committed price changes to subscribed clients, serves snapshots
//! for reconciliation, and exposes the read and admin REST endpoints.

pub mod broadcaster;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod rest_api;
pub mod websocket_handler;

pub use broadcaster::{PriceBroadcaster, PublishStats, Subscription};
pub use client::{PriceFeedClient, PriceView};
pub use config::{GatewayConfig, ReconcileConfig};
pub use error::{GatewayError, GatewayResult};
pub use gateway::PriceGateway;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8080;

/// Default REST port
pub const DEFAULT_REST_PORT: u16 = 8081;

/// Default maximum connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;
