//! Configuration for the PriceGateway

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

/// Main configuration for the PriceGateway
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// WebSocket server configuration
    pub server: ServerConfig,

    /// REST API configuration
    pub rest: RestConfig,

    /// Push fan-out configuration
    pub broadcast: BroadcastConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to bind to
    pub port: u16,

    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

/// REST API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Enable the REST API
    pub enabled: bool,

    /// Host to bind to
    pub host: String,

    /// Port to bind to
    pub port: u16,
}

/// Push fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Outbound queue size per client; a full queue drops messages for that client
    pub client_queue_capacity: usize,
}

/// Client-side reconciliation timings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Pull a snapshot when nothing was pushed for this long
    pub staleness_window_secs: u64,

    /// Pull a snapshot at least this often regardless of push activity
    pub reconcile_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: crate::DEFAULT_PORT,
            max_connections: crate::DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self { enabled: true, host: "0.0.0.0".to_string(), port: crate::DEFAULT_REST_PORT }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { client_queue_capacity: 64 }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { staleness_window_secs: 90, reconcile_interval_secs: 120 }
    }
}

impl ReconcileConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl GatewayConfig {
    /// Get the WebSocket server address
    pub fn server_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }

    /// Get the REST API address
    pub fn rest_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.rest.host, self.rest.port).parse()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &str) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse {path}: {e}")))
    }

    /// Apply `GATEWAY_*` environment overrides
    pub fn with_env_overrides(mut self) -> GatewayResult<Self> {
        if let Ok(host) = std::env::var("GATEWAY_HOST") {
            self.server.host = host.clone();
            self.rest.host = host;
        }

        if let Ok(port) = std::env::var("GATEWAY_WS_PORT") {
            self.server.port = parse_env("GATEWAY_WS_PORT", &port)?;
        }

        if let Ok(port) = std::env::var("GATEWAY_REST_PORT") {
            self.rest.port = parse_env("GATEWAY_REST_PORT", &port)?;
        }

        if let Ok(max) = std::env::var("GATEWAY_MAX_CONNECTIONS") {
            self.server.max_connections = parse_env("GATEWAY_MAX_CONNECTIONS", &max)?;
        }

        if let Ok(capacity) = std::env::var("GATEWAY_CLIENT_QUEUE_CAPACITY") {
            self.broadcast.client_queue_capacity = parse_env("GATEWAY_CLIENT_QUEUE_CAPACITY", &capacity)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.broadcast.client_queue_capacity == 0 {
            return Err(GatewayError::Config("client_queue_capacity must be non-zero".to_string()));
        }
        if self.server.port == self.rest.port && self.rest.enabled {
            return Err(GatewayError::Config(format!(
                "WebSocket and REST servers cannot share port {}",
                self.server.port
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> GatewayResult<T> {
    value
        .parse()
        .map_err(|_| GatewayError::Config(format!("Invalid value for {name}: {value}")))
}
