//! # sessionpool - Callback-driven session pool
//!
//! `sessionpool` turns byte-stream sockets into managed, callback-driven
//! sessions. A [`SessionPool`] owns a fixed set of I/O worker threads and a
//! table of handles: listeners, connectors with bounded retry, imported
//! sockets and established sessions.
//!
//! ## Features
//!
//! - **Pinned workers**: every connection stays on one worker thread, so its
//!   callbacks arrive strictly in order
//! - **Bounded connect retry**: per-attempt deadline, retry interval, and
//!   host resolution once or before every attempt
//! - **Race-free abort**: a connect that succeeds after the connector was
//!   closed is discarded
//! - **Write-cache backpressure**: edge-triggered low/high watermark
//!   notifications per connection
//! - **Connection limit**: requests beyond `max_connections` are refused and
//!   reported through the pool callback
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sessionpool::echo::EchoSessionFactory;
//! use sessionpool::{ListenOptions, PoolConfig, SessionPool, TcpTransport};
//! use std::sync::Arc;
//!
//! let pool = SessionPool::new(PoolConfig::default(), TcpTransport::with_defaults(), |state, source, _| {
//!     eprintln!("pool event {:?} from {:?}", state, source);
//! })?;
//! pool.start()?;
//!
//! let listener = pool.listen(
//!     "127.0.0.1:0".parse()?,
//!     Arc::new(EchoSessionFactory::new()),
//!     |state, handle, _session, _user_data| println!("{} -> {:?}", handle, state),
//!     ListenOptions::default(),
//! )?;
//! println!("echoing on {}", pool.listen_addr(listener)?);
//!
//! pool.stop()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! listen/connect/import -> HandleTable -> worker task
//!     -> (accept | connect attempts | adopt) -> SessionFactory::allocate
//!     -> Session::start -> traffic through AsyncChannel -> Session::stop
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod channel;
pub mod config;
pub mod connector;
pub mod echo;
pub mod error;
pub mod handle;
pub mod helper;
pub mod pool;
pub mod session;
pub mod transport;

// Re-export commonly used items
pub use channel::{AsyncChannel, Watermarks};
pub use config::{load_config, Config, PoolConfig};
pub use connector::{ConnectOptions, ResolutionMode};
pub use error::{ChannelError, PoolError};
pub use handle::{
    HandleId, HandleKind, PoolState, PoolStateCallback, SessionState, SessionStateCallback,
    UserData,
};
pub use pool::{ListenOptions, PoolStatsSnapshot, SessionPool};
pub use session::{AllocateCallback, Session, SessionFactory};
pub use transport::{SocketOpts, TcpTransport, Transport};

/// Version of the sessionpool library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the library
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "sessionpool");
    }
}
