//! Service configuration management

use anyhow::{Context, Result};
use price_gateway::GatewayConfig;
use pricing_engine::PricingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main service configuration
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Pricing engine configuration
    pub pricing: PricingConfig,

    /// WebSocket and REST configuration
    pub gateway: GatewayConfig,

    /// Service-level configuration
    pub service: ServiceSettings,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Apply embedded migrations at startup
    pub run_migrations: bool,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics
    pub enabled: bool,

    /// Metrics export port
    pub port: u16,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { run_migrations: true, shutdown_timeout_secs: 10 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true, port: 9090 }
    }
}

/// Load configuration from the environment, with gateway settings optionally
/// read from a TOML file first
pub fn load_config(gateway_file: Option<&Path>) -> Result<ServiceConfig> {
    let mut config = ServiceConfig {
        pricing: PricingConfig::from_env().context("Failed to load pricing configuration")?,
        ..ServiceConfig::default()
    };

    if let Some(path) = gateway_file {
        tracing::debug!("Loading gateway configuration from file: {:?}", path);
        config.gateway = GatewayConfig::load_from_file(&path.to_string_lossy())
            .context("Failed to load gateway configuration")?;
    }
    config.gateway = config.gateway.with_env_overrides().context("Invalid gateway configuration")?;

    load_from_env(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Load service-level settings from environment variables
fn load_from_env(config: &mut ServiceConfig) -> Result<()> {
    if let Ok(level) = std::env::var("PRICING_LOG_LEVEL") {
        config.logging.level = level;
    }

    if let Ok(format) = std::env::var("PRICING_LOG_FORMAT") {
        config.logging.format = format;
    }

    if let Ok(enabled) = std::env::var("PRICING_METRICS_ENABLED") {
        config.metrics.enabled =
            enabled.parse().with_context(|| format!("Invalid PRICING_METRICS_ENABLED: {enabled}"))?;
    }

    if let Ok(port) = std::env::var("PRICING_METRICS_PORT") {
        config.metrics.port = port.parse().with_context(|| format!("Invalid PRICING_METRICS_PORT: {port}"))?;
    }

    if let Ok(run) = std::env::var("PRICING_RUN_MIGRATIONS") {
        config.service.run_migrations =
            run.parse().with_context(|| format!("Invalid PRICING_RUN_MIGRATIONS: {run}"))?;
    }

    if let Ok(timeout) = std::env::var("PRICING_SHUTDOWN_TIMEOUT_SECS") {
        config.service.shutdown_timeout_secs =
            timeout.parse().with_context(|| format!("Invalid PRICING_SHUTDOWN_TIMEOUT_SECS: {timeout}"))?;
    }

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ServiceConfig) -> Result<()> {
    match config.logging.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow::anyhow!("Invalid log level: {}", config.logging.level)),
    }

    match config.logging.format.as_str() {
        "json" | "pretty" => {}
        _ => return Err(anyhow::anyhow!("Invalid log format: {}", config.logging.format)),
    }

    if config.metrics.enabled {
        let port = config.metrics.port;
        if port == 0 || port == config.gateway.server.port || (config.gateway.rest.enabled && port == config.gateway.rest.port) {
            return Err(anyhow::anyhow!("Invalid metrics port: {}", port));
        }
    }

    Ok(())
}
