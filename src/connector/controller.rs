//! Bounded connect retry loop

use super::{AttemptState, ConnectOptions, ConnectPhase, ResolutionMode};
use crate::transport::{AddrMaybeCached, SocketOpts, Transport};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Final result of a connector
#[derive(Debug)]
pub enum ConnectOutcome<S> {
    /// A connection was established and not aborted
    Established {
        /// The connected stream
        stream: S,
        /// The address it is connected to
        addr: SocketAddr,
    },
    /// Every attempt failed; carries the last error
    Failed(anyhow::Error),
    /// The connector was aborted
    Aborted,
}

enum Attempt<S> {
    Connected(S, SocketAddr),
    Failed(anyhow::Error),
    Aborted,
}

/// Drives the connect attempts of one connector
///
/// The controller owns its target address and attempt counter. Only the
/// phase is shared, so that a close from another thread can abort it.
#[derive(Debug)]
pub struct ConnectionAttemptController<T: Transport> {
    transport: Arc<T>,
    target: AddrMaybeCached,
    num_attempts: u32,
    interval: Duration,
    resolution: ResolutionMode,
    socket_opts: Option<SocketOpts>,
    state: Arc<AttemptState>,
    cancel: CancellationToken,
    attempts: u32,
}

impl<T: Transport> ConnectionAttemptController<T> {
    /// Create a controller; `options` must already be validated
    pub fn new(
        transport: Arc<T>,
        target: AddrMaybeCached,
        options: &ConnectOptions,
        state: Arc<AttemptState>,
        cancel: CancellationToken,
    ) -> Self {
        ConnectionAttemptController {
            transport,
            target,
            num_attempts: options.num_attempts.max(1),
            interval: options.interval,
            resolution: options.resolution,
            socket_opts: options.socket_opts.clone(),
            state,
            cancel,
            attempts: 0,
        }
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run attempts until one succeeds, all fail, or the connector is aborted
    ///
    /// `on_attempt_failed` is called with the attempt number and error for
    /// every failed attempt except the last one.
    pub async fn run<F>(&mut self, mut on_attempt_failed: F) -> ConnectOutcome<T::Stream>
    where
        F: FnMut(u32, &anyhow::Error),
    {
        loop {
            self.attempts += 1;
            let error = match self.attempt_once().await {
                Attempt::Connected(stream, addr) => {
                    if self.state.establish() {
                        debug!("Connected to {} on attempt {}", addr, self.attempts);
                        return ConnectOutcome::Established { stream, addr };
                    }
                    // Aborted while the connect was completing
                    debug!("Discarding connection to {} after abort", addr);
                    drop(stream);
                    return ConnectOutcome::Aborted;
                }
                Attempt::Aborted => return ConnectOutcome::Aborted,
                Attempt::Failed(error) => error,
            };

            if self.attempts >= self.num_attempts {
                if !self.state.fail() {
                    return ConnectOutcome::Aborted;
                }
                warn!(
                    "Connect to {} failed after {} attempt(s): {:#}",
                    self.target.addr(),
                    self.attempts,
                    error
                );
                return ConnectOutcome::Failed(error);
            }

            debug!(
                "Connect attempt {}/{} to {} failed: {:#}",
                self.attempts,
                self.num_attempts,
                self.target.addr(),
                error
            );
            on_attempt_failed(self.attempts, &error);

            if !self.state.enter(ConnectPhase::RetryWait) {
                return ConnectOutcome::Aborted;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ConnectOutcome::Aborted,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn attempt_once(&mut self) -> Attempt<T::Stream> {
        if !self.state.enter(ConnectPhase::Resolving) {
            return Attempt::Aborted;
        }

        let cancel = self.cancel.clone();
        let transport = &*self.transport;
        let target = &mut self.target;
        let resolution = self.resolution;
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Aborted,
            r = async move {
                match resolution {
                    ResolutionMode::ResolveOnce => target.resolve(transport).await,
                    ResolutionMode::ResolveAtEachAttempt => target.resolve_fresh(transport).await,
                }
            } => r,
        };
        let addr = match resolved {
            Ok(addr) => addr,
            Err(e) => return Attempt::Failed(e),
        };

        if !self.state.enter(ConnectPhase::Connecting) {
            return Attempt::Aborted;
        }

        let connect = transport.connect(addr, self.socket_opts.as_ref());
        let interval = self.interval;
        let result: Result<T::Stream> = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Aborted,
            r = async {
                if interval.is_zero() {
                    connect.await
                } else {
                    tokio::time::timeout(interval, connect)
                        .await
                        .with_context(|| format!("Connect attempt to {} timed out", addr))?
                }
            } => r,
        };

        match result {
            Ok(stream) => Attempt::Connected(stream, addr),
            Err(e) => Attempt::Failed(e),
        }
    }
}
