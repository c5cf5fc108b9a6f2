//! Authoritative connect phase
//!
//! The phase is the single point where a concurrently succeeding connect
//! and an abort are ordered: whichever transition is applied first wins and
//! the other is rejected.

use parking_lot::Mutex;

/// Phase of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    /// Created, no attempt made yet
    Pending,
    /// Resolving the target address
    Resolving,
    /// A connect call is in flight
    Connecting,
    /// Waiting for the retry interval to elapse
    RetryWait,
    /// A connection was established
    Established,
    /// Aborted by close or shutdown
    Aborted,
    /// Every attempt failed
    Failed,
}

impl ConnectPhase {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectPhase::Established | ConnectPhase::Aborted | ConnectPhase::Failed
        )
    }
}

/// Shared, lock-protected phase of one connector
#[derive(Debug)]
pub struct AttemptState {
    phase: Mutex<ConnectPhase>,
}

impl Default for AttemptState {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptState {
    /// Create a state in [`ConnectPhase::Pending`]
    pub fn new() -> Self {
        AttemptState {
            phase: Mutex::new(ConnectPhase::Pending),
        }
    }

    /// Current phase
    pub fn phase(&self) -> ConnectPhase {
        *self.phase.lock()
    }

    /// Move to a working phase; fails once the connector has terminated
    pub fn enter(&self, next: ConnectPhase) -> bool {
        let mut phase = self.phase.lock();
        if phase.is_terminal() {
            return false;
        }
        *phase = next;
        true
    }

    /// Abort the connector; returns `false` if it had already terminated
    pub fn abort(&self) -> bool {
        self.enter(ConnectPhase::Aborted)
    }

    /// Record that every attempt failed
    pub fn fail(&self) -> bool {
        self.enter(ConnectPhase::Failed)
    }

    /// Record a successful connect
    ///
    /// Only a connect that is still in flight may succeed; a success that
    /// arrives after an abort is rejected.
    pub fn establish(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase != ConnectPhase::Connecting {
            return false;
        }
        *phase = ConnectPhase::Established;
        true
    }
}
