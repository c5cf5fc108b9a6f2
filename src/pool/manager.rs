//! Pool statistics and health monitoring
//!
//! Counts lifecycle events and periodically logs pool health.

use super::worker::WorkerPool;
use crate::handle::{HandleEntry, HandleTable};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Statistics for the session pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Sessions currently up
    pub sessions_up: AtomicUsize,
    /// Sessions that reached `Up`
    pub total_established: AtomicUsize,
    /// Connections accepted by listeners
    pub total_accepted: AtomicUsize,
    /// Requests and accepted connections refused by the connection limit
    pub total_rejected: AtomicUsize,
    /// Connectors that exhausted their attempts
    pub connect_failures: AtomicUsize,
    /// Failed session allocations
    pub alloc_failures: AtomicUsize,
    /// Sessions that failed to start
    pub startup_failures: AtomicUsize,
    /// Sessions whose `stop` returned an error
    pub stop_failures: AtomicUsize,
    /// Bytes written to sockets
    pub bytes_written: AtomicU64,
}

impl PoolStats {
    /// Create new pool stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session coming up
    pub fn record_up(&self) {
        self.total_established.fetch_add(1, Ordering::Relaxed);
        self.sessions_up.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session going down
    pub fn record_down(&self) {
        self.sessions_up.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record an accepted connection
    pub fn record_accepted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refusal due to the connection limit
    pub fn record_rejected(&self) {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an exhausted connector
    pub fn record_connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed allocation
    pub fn record_alloc_failed(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed session start
    pub fn record_startup_failed(&self) {
        self.startup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed session stop
    pub fn record_stop_failed(&self) {
        self.stop_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes flushed to a socket
    pub fn record_bytes_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            sessions_up: self.sessions_up.load(Ordering::Relaxed),
            total_established: self.total_established.load(Ordering::Relaxed),
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            startup_failures: self.startup_failures.load(Ordering::Relaxed),
            stop_failures: self.stop_failures.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Sessions currently up
    pub sessions_up: usize,
    /// Sessions that reached `Up` since start
    pub total_established: usize,
    /// Connections accepted by listeners
    pub total_accepted: usize,
    /// Requests refused by the connection limit
    pub total_rejected: usize,
    /// Connectors that exhausted their attempts
    pub connect_failures: usize,
    /// Failed session allocations
    pub alloc_failures: usize,
    /// Sessions that failed to start
    pub startup_failures: usize,
    /// Sessions whose stop returned an error
    pub stop_failures: usize,
    /// Bytes written to sockets
    pub bytes_written: u64,
}

/// Background health logger of a running pool
pub(crate) struct PoolManager {
    stats: Arc<PoolStats>,
    table: Arc<HandleTable<HandleEntry>>,
    workers: Weak<WorkerPool>,
    interval: Duration,
}

impl PoolManager {
    pub(crate) fn new(
        stats: Arc<PoolStats>,
        table: Arc<HandleTable<HandleEntry>>,
        workers: Weak<WorkerPool>,
        interval: Duration,
    ) -> Self {
        PoolManager {
            stats,
            table,
            workers,
            interval,
        }
    }

    /// Log health every interval until cancelled
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.log_health(),
            }
        }
        debug!("Pool health monitor stopped");
    }

    /// Log pool health status
    pub(crate) fn log_health(&self) {
        let stats = self.stats.snapshot();
        let loads = self
            .workers
            .upgrade()
            .map(|workers| workers.loads())
            .unwrap_or_default();
        info!(
            "Pool health: handles={}, up={}, established={}, accepted={}, rejected={}, connect_failed={}, alloc_failed={}, startup_failed={}, written={}B, worker_loads={:?}",
            self.table.len(),
            stats.sessions_up,
            stats.total_established,
            stats.total_accepted,
            stats.total_rejected,
            stats.connect_failures,
            stats.alloc_failures,
            stats.startup_failures,
            stats.bytes_written,
            loads
        );
    }
}
