//! Pricing Service Library
//!
//! Wires the pricing engine, its tick scheduler, the WebSocket price feed and
//! the REST API into one process, with logging, metrics export and graceful
//! shutdown.

use anyhow::{Context, Result};
use std::path::Path;

pub mod config;
pub mod logging;
pub mod service;
pub mod signals;

pub use config::ServiceConfig;
pub use logging::initialize_logging;
pub use service::{ServiceHandles, ServiceState};
pub use signals::{graceful_shutdown, setup_signal_handlers};

/// Load configuration from the environment and an optional gateway TOML file
pub fn load_configuration(gateway_file: Option<&Path>) -> Result<ServiceConfig> {
    config::load_config(gateway_file).context("Failed to load service configuration")
}
