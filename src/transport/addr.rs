//! Address handling with DNS caching
//!
//! Provides address resolution with optional caching, which is what
//! distinguishes resolving a connect target once from resolving it before
//! every attempt.

use super::Transport;
use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolve a `host:port` string to its first socket address
pub async fn resolve_host(host: &str) -> Result<SocketAddr> {
    // Use blocking task for DNS resolution since ToSocketAddrs is blocking
    let addr = host.to_string();
    let resolved = tokio::task::spawn_blocking(move || {
        addr.to_socket_addrs()
            .with_context(|| format!("Failed to resolve address: {}", addr))?
            .next()
            .with_context(|| format!("No addresses found for: {}", addr))
    })
    .await
    .with_context(|| "DNS resolution task panicked")??;

    Ok(resolved)
}

/// Address that may have a cached resolved address
///
/// This type holds an address string and optionally caches the resolved
/// socket address to avoid repeated DNS lookups. It is owned by a single
/// connector, so the cache needs no locking.
#[derive(Debug, Clone)]
pub struct AddrMaybeCached {
    /// The original address string
    addr: String,
    /// Cached resolved address
    cached: Option<SocketAddr>,
}

impl AddrMaybeCached {
    /// Create a new address without cached resolution
    pub fn new(addr: &str) -> Self {
        AddrMaybeCached {
            addr: addr.to_string(),
            cached: None,
        }
    }

    /// Create a new address with a pre-resolved address
    pub fn with_cached(addr: &str, resolved: SocketAddr) -> Self {
        AddrMaybeCached {
            addr: addr.to_string(),
            cached: Some(resolved),
        }
    }

    /// Get the original address string
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Get the cached address if available
    pub fn cached(&self) -> Option<SocketAddr> {
        self.cached
    }

    /// Resolve the address, using cache if available
    pub async fn resolve<T: Transport + ?Sized>(&mut self, transport: &T) -> Result<SocketAddr> {
        if let Some(cached) = self.cached {
            return Ok(cached);
        }
        self.resolve_fresh(transport).await
    }

    /// Resolve the address without using cache, refreshing the cache
    pub async fn resolve_fresh<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
    ) -> Result<SocketAddr> {
        // Literal socket addresses never need a lookup
        let resolved = match self.addr.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => transport.resolve(&self.addr).await?,
        };
        self.cached = Some(resolved);
        Ok(resolved)
    }
}

impl From<SocketAddr> for AddrMaybeCached {
    fn from(addr: SocketAddr) -> Self {
        AddrMaybeCached::with_cached(&addr.to_string(), addr)
    }
}

impl From<&str> for AddrMaybeCached {
    fn from(addr: &str) -> Self {
        AddrMaybeCached::new(addr)
    }
}

impl From<String> for AddrMaybeCached {
    fn from(addr: String) -> Self {
        AddrMaybeCached::new(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_addr_maybe_cached_new() {
        let addr = AddrMaybeCached::new("example.com:80");
        assert_eq!(addr.addr(), "example.com:80");
        assert!(addr.cached().is_none());
    }

    #[test]
    fn test_addr_maybe_cached_with_cached() {
        let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        let addr = AddrMaybeCached::with_cached("localhost:8080", socket_addr);

        assert_eq!(addr.addr(), "localhost:8080");
        assert_eq!(addr.cached(), Some(socket_addr));
    }

    #[test]
    fn test_addr_maybe_cached_from_socket_addr() {
        let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 443);
        let addr: AddrMaybeCached = socket_addr.into();

        assert_eq!(addr.addr(), "10.0.0.1:443");
        assert_eq!(addr.cached(), Some(socket_addr));
    }

    #[test]
    fn test_addr_maybe_cached_from_strings() {
        let a: AddrMaybeCached = "host:1".into();
        let b: AddrMaybeCached = String::from("host:2").into();
        assert_eq!(a.addr(), "host:1");
        assert_eq!(b.addr(), "host:2");
    }

    #[tokio::test]
    async fn test_resolve_host_localhost() {
        let resolved = resolve_host("127.0.0.1:8080").await.unwrap();

        assert_eq!(resolved.ip(), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(resolved.port(), 8080);
    }

    #[tokio::test]
    async fn test_resolve_host_invalid() {
        assert!(resolve_host("not an address").await.is_err());
    }
}
