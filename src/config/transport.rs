//! Transport configuration types
//!
//! Defines configuration for the transport protocol.

use serde::{Deserialize, Serialize};

/// Transport type enumeration
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP transport
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
}

/// Main transport configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TransportConfig {
    /// Transport type
    #[serde(rename = "type", default)]
    pub transport_type: TransportType,

    /// TCP configuration
    #[serde(default)]
    pub tcp: TcpConfig,
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// Default connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

fn default_nodelay() -> bool {
    true
}

/// TCP transport configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Upper bound on a single connect call, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}
