//! RAII guard for connection slots
//!
//! Provides automatic release of a connection slot when the connector or
//! session holding it is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counter enforcing the pool's connection limit
#[derive(Debug)]
pub(crate) struct ConnectionLimiter {
    max: usize,
    active: AtomicUsize,
}

impl ConnectionLimiter {
    pub(crate) fn new(max: usize) -> Self {
        ConnectionLimiter {
            max,
            active: AtomicUsize::new(0),
        }
    }

    /// Take a slot, or `None` if the limit is reached
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConnectionSlot {
                        limiter: self.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    pub(crate) fn is_full(&self) -> bool {
        self.active() >= self.max
    }
}

/// One occupied connection slot, released on drop
#[derive(Debug)]
pub(crate) struct ConnectionSlot {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::AcqRel);
    }
}
