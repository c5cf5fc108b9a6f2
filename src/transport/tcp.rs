//! TCP transport implementation
//!
//! Provides plain TCP listeners and connections.

use super::{SocketOpts, Transport};
use crate::config::TransportConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Listening socket together with the options applied to accepted streams
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    opts: SocketOpts,
}

/// TCP transport for plain connections
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Socket options to apply when none are given per handle
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a new TCP transport with default options
    pub fn with_defaults() -> Self {
        TcpTransport {
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpAcceptor;

    fn new(config: &TransportConfig) -> Result<Self> {
        let socket_opts = SocketOpts::from_tcp_config(&config.tcp);
        Ok(TcpTransport {
            socket_opts,
            connect_timeout: Duration::from_secs(config.tcp.connect_timeout),
        })
    }

    fn peer_addr(conn: &Self::Stream) -> Option<SocketAddr> {
        conn.peer_addr().ok()
    }

    fn bind(
        &self,
        addr: SocketAddr,
        backlog: u32,
        opts: Option<&SocketOpts>,
    ) -> Result<Self::Listener> {
        let opts = opts.unwrap_or(&self.socket_opts).clone();

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .context("Failed to create listening socket")?;
        socket.set_reuse_address(opts.reuse_address)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("Failed to bind {}", addr))?;
        socket
            .listen(backlog.min(i32::MAX as u32) as i32)
            .with_context(|| format!("Failed to listen on {}", addr))?;
        socket.set_nonblocking(true)?;

        let listener = TcpListener::from_std(socket.into())
            .context("Failed to register listener with the runtime")?;

        tracing::debug!("TCP listener bound to {}", addr);

        Ok(TcpAcceptor { listener, opts })
    }

    fn local_addr(listener: &Self::Listener) -> Result<SocketAddr> {
        listener
            .listener
            .local_addr()
            .context("Failed to read listener address")
    }

    fn reregister(&self, stream: Self::Stream) -> Result<Self::Stream> {
        let stream = stream
            .into_std()
            .context("Failed to detach stream from its worker")?;
        TcpStream::from_std(stream).context("Failed to register stream with the worker")
    }

    async fn accept(&self, listener: &Self::Listener) -> Result<(Self::Stream, SocketAddr)> {
        let (stream, peer) = listener
            .listener
            .accept()
            .await
            .context("Failed to accept connection")?;

        listener.opts.apply(&stream)?;

        Ok((stream, peer))
    }

    async fn connect(&self, addr: SocketAddr, opts: Option<&SocketOpts>) -> Result<Self::Stream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("Connection timeout to {}", addr))?
            .with_context(|| format!("Failed to connect to {}", addr))?;

        // Apply socket options
        opts.unwrap_or(&self.socket_opts).apply(&stream)?;

        tracing::debug!("TCP connection established to {}", addr);

        Ok(stream)
    }
}
