//! Configuration module for the session pool
//!
//! This module provides configuration types and parsing for the pool and
//! its transport.

mod pool;
mod transport;

pub use pool::{IncomingMessageSizes, PoolConfig};
pub use transport::{TcpConfig, TransportConfig, TransportType};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Session pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate()
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}
