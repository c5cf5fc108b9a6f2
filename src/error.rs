//! Error types for the session pool
//!
//! This module defines the synchronous error types returned by the public
//! API. Asynchronous failures (connect, accept, allocation) are never
//! returned here; they are reported through the state callbacks.

use crate::handle::HandleId;
use std::io;
use thiserror::Error;

/// Main error type for session pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool has not been started, or has been stopped
    #[error("Session pool is not running")]
    NotRunning,

    /// No live handle has this id
    #[error("Handle not found: {0}")]
    HandleNotFound(HandleId),

    /// Accepting the request would exceed the configured connection limit
    #[error("Session limit reached: {0} connections")]
    SessionLimitReached(usize),

    /// Caller-supplied arguments violate the API contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Transport error
    #[error("Transport error: {0:#}")]
    Transport(anyhow::Error),

    /// Some worker threads did not exit within the grace period
    #[error("Timeout: {0} worker(s) did not stop within the grace period")]
    ShutdownTimeout(usize),

    /// The pool stopped, but some handles had to be destroyed forcibly
    #[error("Forced cleanup of {0} handle(s) during shutdown")]
    ForcedCleanup(usize),
}

impl PoolError {
    /// Integer status code for this error.
    ///
    /// Success is `0` (`Ok`). Every "could not even begin" failure maps to a
    /// distinct positive code. A forced shutdown cleanup is the only negative
    /// code: the pool is stopped, but not every handle went down gracefully.
    pub fn code(&self) -> i32 {
        match self {
            PoolError::NotRunning => 1,
            PoolError::HandleNotFound(_) => 2,
            PoolError::SessionLimitReached(_) => 3,
            PoolError::InvalidArgument(_) => 4,
            PoolError::Config(_) => 5,
            PoolError::Io(_) => 6,
            PoolError::Transport(_) => 7,
            PoolError::ShutdownTimeout(_) => 8,
            PoolError::ForcedCleanup(_) => -1,
        }
    }
}

/// Errors reported by [`AsyncChannel`](crate::channel::AsyncChannel) operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel has been closed locally
    #[error("Channel closed")]
    Closed,

    /// The channel's connection has gone down
    #[error("Channel disconnected")]
    Disconnected,
}
