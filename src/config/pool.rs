//! Session pool configuration
//!
//! Defines worker, connection limit, watermark and shutdown settings.

use crate::channel::Watermarks;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of I/O worker threads
fn default_max_threads() -> usize {
    4
}

/// Default maximum number of concurrent connections
fn default_max_connections() -> usize {
    1024
}

/// Default metrics interval in seconds
fn default_metrics_interval() -> u64 {
    30
}

/// Default low write-cache watermark
fn default_low_watermark() -> usize {
    0
}

/// Default high write-cache watermark
fn default_high_watermark() -> usize {
    1024 * 1024
}

/// Default shutdown grace period in seconds
fn default_shutdown_timeout() -> u64 {
    5
}

/// Hints for sizing the incoming read buffer of each channel
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct IncomingMessageSizes {
    /// Smallest read the channel performs
    pub min: usize,
    /// Initial read buffer capacity
    pub typical: usize,
    /// Largest single read
    pub max: usize,
}

impl Default for IncomingMessageSizes {
    fn default() -> Self {
        IncomingMessageSizes {
            min: 1,
            typical: 1024,
            max: 1024 * 1024,
        }
    }
}

/// Session pool configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    /// Number of I/O worker threads
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Maximum number of concurrent connectors and sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Interval of the health log in seconds, 0 disables it
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval: u64,

    /// Default low write-cache watermark in bytes
    #[serde(default = "default_low_watermark")]
    pub write_cache_low_watermark: usize,

    /// Default high write-cache watermark in bytes
    #[serde(default = "default_high_watermark")]
    pub write_cache_high_watermark: usize,

    /// Read buffer sizing hints
    #[serde(default)]
    pub incoming_message_sizes: IncomingMessageSizes,

    /// Grace period for workers to exit on stop, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_threads: default_max_threads(),
            max_connections: default_max_connections(),
            metrics_interval: default_metrics_interval(),
            write_cache_low_watermark: default_low_watermark(),
            write_cache_high_watermark: default_high_watermark(),
            incoming_message_sizes: IncomingMessageSizes::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl PoolConfig {
    /// Validate the pool configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_threads == 0 {
            return Err("max_threads must be greater than 0".to_string());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.write_cache_low_watermark > self.write_cache_high_watermark {
            return Err(
                "write_cache_low_watermark cannot be greater than write_cache_high_watermark"
                    .to_string(),
            );
        }
        let sizes = &self.incoming_message_sizes;
        if sizes.min == 0 || sizes.min > sizes.typical || sizes.typical > sizes.max {
            return Err(
                "incoming_message_sizes must satisfy 0 < min <= typical <= max".to_string(),
            );
        }
        Ok(())
    }

    /// Default watermarks for new handles
    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            low: self.write_cache_low_watermark,
            high: self.write_cache_high_watermark,
        }
    }

    /// Health log interval, `None` when disabled
    pub fn metrics_interval(&self) -> Option<Duration> {
        match self.metrics_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Grace period of `stop()`
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}
