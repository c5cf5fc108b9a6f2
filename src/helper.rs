//! Helper constants and utilities
//!
//! This module provides defaults shared across the pool.

use std::time::Duration;

/// Default accept backlog of a listener
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Pause after a failed accept before the listener tries again
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Parse duration from seconds
pub fn duration_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
