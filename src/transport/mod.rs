//! Transport module for the session pool
//!
//! This module provides the boundary to the underlying byte-stream
//! transport: binding and accepting, connecting, and name resolution. The
//! pool drives everything else (retry, timers, read/write scheduling) on its
//! own workers.

mod addr;
mod tcp;

pub use addr::{resolve_host, AddrMaybeCached};
pub use tcp::{TcpAcceptor, TcpTransport};

use crate::config::TcpConfig;
use crate::config::TransportConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
    /// Allow rebinding a listening address in TIME_WAIT
    pub reuse_address: bool,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
            reuse_address: true,
        }
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
            reuse_address: true,
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Transport trait for different connection types
///
/// Implementations produce listeners and streams; the pool owns everything
/// built on top of them. `bind` is synchronous and is always called from
/// within the runtime context of the worker that will own the listener.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// The stream type produced by this transport
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug + 'static;

    /// The listener type produced by [`Transport::bind`]
    type Listener: Debug + Send + Sync + 'static;

    /// Create a new transport instance from configuration
    fn new(config: &TransportConfig) -> Result<Self>
    where
        Self: Sized;

    /// Address of the remote end of a connection, if known
    fn peer_addr(conn: &Self::Stream) -> Option<SocketAddr>;

    /// Bind a listener on `addr` with the given accept backlog
    fn bind(
        &self,
        addr: SocketAddr,
        backlog: u32,
        opts: Option<&SocketOpts>,
    ) -> Result<Self::Listener>;

    /// Address a listener is bound to
    fn local_addr(listener: &Self::Listener) -> Result<SocketAddr>;

    /// Accept one connection
    async fn accept(&self, listener: &Self::Listener) -> Result<(Self::Stream, SocketAddr)>;

    /// Connect to a resolved remote address
    async fn connect(&self, addr: SocketAddr, opts: Option<&SocketOpts>) -> Result<Self::Stream>;

    /// Register a stream with the reactor of the current runtime context
    ///
    /// Called inside the context of the worker that will drive the stream,
    /// so its readiness is never polled by another worker. Streams that are
    /// not bound to a reactor are returned unchanged.
    fn reregister(&self, stream: Self::Stream) -> Result<Self::Stream> {
        Ok(stream)
    }

    /// Resolve a `host:port` string
    async fn resolve(&self, host: &str) -> Result<SocketAddr> {
        resolve_host(host).await
    }
}
