//! Outgoing connection establishment
//!
//! A connector resolves its target, makes up to `num_attempts` connect
//! attempts separated by `interval`, and can be aborted at any point.

mod attempt;
mod controller;

pub use attempt::{AttemptState, ConnectPhase};
pub use controller::{ConnectOutcome, ConnectionAttemptController};

use crate::error::PoolError;
use crate::handle::UserData;
use crate::transport::SocketOpts;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// When the target host name is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Resolve before the first attempt and reuse the address
    #[default]
    ResolveOnce,
    /// Resolve again before every attempt
    ResolveAtEachAttempt,
}

/// Parameters of [`SessionPool::connect`](crate::SessionPool::connect)
#[derive(Clone)]
pub struct ConnectOptions {
    /// Total number of connect attempts, at least 1
    pub num_attempts: u32,
    /// Delay between attempts and deadline of each attempt
    pub interval: Duration,
    /// Host name resolution policy
    pub resolution: ResolutionMode,
    /// Socket options for the connection, transport defaults if unset
    pub socket_opts: Option<SocketOpts>,
    /// Passed back to every callback for this handle
    pub user_data: Option<UserData>,
}

impl ConnectOptions {
    /// Options for `num_attempts` attempts separated by `interval`
    pub fn new(num_attempts: u32, interval: Duration) -> Self {
        ConnectOptions {
            num_attempts,
            interval,
            resolution: ResolutionMode::default(),
            socket_opts: None,
            user_data: None,
        }
    }

    /// Set the resolution mode
    pub fn with_resolution(mut self, resolution: ResolutionMode) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = Some(opts);
        self
    }

    /// Attach user data
    pub fn with_user_data(mut self, user_data: UserData) -> Self {
        self.user_data = Some(user_data);
        self
    }

    /// Check the retry parameters
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.num_attempts == 0 {
            return Err(PoolError::InvalidArgument(
                "num_attempts must be at least 1".to_string(),
            ));
        }
        if self.num_attempts > 1 && self.interval.is_zero() {
            return Err(PoolError::InvalidArgument(
                "interval must be positive when retrying".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions::new(1, Duration::ZERO)
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("num_attempts", &self.num_attempts)
            .field("interval", &self.interval)
            .field("resolution", &self.resolution)
            .field("socket_opts", &self.socket_opts)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}
