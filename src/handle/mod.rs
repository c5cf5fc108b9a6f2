//! Handles, lifecycle states and callback types
//!
//! Every listener, connector, imported socket and established session the
//! pool manages is identified by a [`HandleId`] and tracked by one
//! [`HandleEntry`] stored in the [`HandleTable`].

mod table;

pub use table::HandleTable;

use crate::channel::{AsyncChannel, Watermarks};
use crate::connector::AttemptState;
use crate::session::{Session, SessionFactory};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

/// Opaque handle identifier
///
/// Packs a slot index and the generation of that slot, so an id is never
/// issued twice by the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        HandleId(((generation as u64) << 32) | index as u64)
    }

    /// Slot index part of the id
    pub fn index(&self) -> u32 {
        self.0 as u32
    }

    /// Generation part of the id
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw integer value of the id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index(), self.generation())
    }
}

/// Current role of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Accepting connections on a local address
    Listener,
    /// Establishing an outgoing connection
    Connector,
    /// Wrapping a caller-supplied socket, session not yet up
    Imported,
    /// Connection established (accepted, connected or imported)
    Established,
}

/// Per-handle lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Session allocated and started
    Up,
    /// Session stopped and deallocated
    Down,
    /// The factory failed to allocate a session
    AllocFailed,
    /// The session was allocated but failed to start
    StartupFailed,
    /// Write cache drained back to the low watermark
    WriteCacheLowWat,
    /// Write cache reached the high watermark
    WriteCacheHiWat,
    /// A listener failed to accept a connection
    AcceptFailed,
    /// A connect attempt failed and another one will follow
    ConnectAttemptFailed,
    /// Every connect attempt failed
    ConnectFailed,
    /// Connection establishment was cancelled
    ConnectAborted,
}

impl SessionState {
    /// Whether this state ends the handle's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Down
                | SessionState::AllocFailed
                | SessionState::StartupFailed
                | SessionState::ConnectFailed
                | SessionState::ConnectAborted
        )
    }
}

/// Pool-wide notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolState {
    /// A request was refused because of the connection limit
    SessionLimitReached,
    /// A listener failed to accept a connection
    AcceptFailed,
    /// A connector exhausted all of its attempts
    ConnectFailed,
}

/// Opaque user data passed back unmodified to callbacks
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Callback invoked on every lifecycle transition of a handle
pub type SessionStateCallback =
    Arc<dyn Fn(SessionState, HandleId, Option<&dyn Session>, Option<&UserData>) + Send + Sync>;

/// Callback invoked on pool-wide conditions; `source` is the handle involved, if any
pub type PoolStateCallback = Arc<dyn Fn(PoolState, Option<HandleId>, Option<&UserData>) + Send + Sync>;

/// Shared record of one handle
///
/// The record is what other threads see of a handle. Session state proper
/// (the session object, read buffer, write-cache counters, attempt counters)
/// lives in the handle's task and is never shared.
pub(crate) struct HandleEntry {
    id: HandleId,
    kind: Mutex<HandleKind>,
    callback: SessionStateCallback,
    user_data: Option<UserData>,
    factory: Arc<dyn SessionFactory>,
    cancel: CancellationToken,
    closing: AtomicBool,
    attempt: Option<Arc<AttemptState>>,
    watermarks: Mutex<Watermarks>,
    channel: Mutex<Option<AsyncChannel>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HandleEntry {
    pub(crate) fn new(
        id: HandleId,
        kind: HandleKind,
        callback: SessionStateCallback,
        factory: Arc<dyn SessionFactory>,
        user_data: Option<UserData>,
        cancel: CancellationToken,
        watermarks: Watermarks,
    ) -> Self {
        HandleEntry {
            id,
            kind: Mutex::new(kind),
            callback,
            user_data,
            factory,
            cancel,
            closing: AtomicBool::new(false),
            attempt: None,
            watermarks: Mutex::new(watermarks),
            channel: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub(crate) fn with_attempt(mut self, attempt: Arc<AttemptState>) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn kind(&self) -> HandleKind {
        *self.kind.lock()
    }

    pub(crate) fn set_kind(&self, kind: HandleKind) {
        *self.kind.lock() = kind;
    }

    pub(crate) fn callback(&self) -> &SessionStateCallback {
        &self.callback
    }

    pub(crate) fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    pub(crate) fn factory(&self) -> &Arc<dyn SessionFactory> {
        &self.factory
    }

    /// Deliver a lifecycle notification to the client
    pub(crate) fn notify(&self, state: SessionState, session: Option<&dyn Session>) {
        debug!("Handle {} -> {:?}", self.id, state);
        (self.callback)(state, self.id, session, self.user_data.as_ref());
    }

    /// Mark the handle as closing and wake its task
    ///
    /// Returns `false` if a close was already requested.
    pub(crate) fn request_close(&self) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(attempt) = &self.attempt {
            attempt.abort();
        }
        self.cancel.cancel();
        true
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn watermarks(&self) -> Watermarks {
        *self.watermarks.lock()
    }

    /// Store new watermarks and forward them to the live channel, if any
    pub(crate) fn set_watermarks(&self, watermarks: Watermarks) {
        *self.watermarks.lock() = watermarks;
        if let Some(channel) = self.channel.lock().as_ref() {
            channel.set_watermarks(watermarks);
        }
    }

    pub(crate) fn attach_channel(&self, channel: AsyncChannel) {
        *self.channel.lock() = Some(channel);
    }

    pub(crate) fn detach_channel(&self) -> Option<AsyncChannel> {
        self.channel.lock().take()
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock() = Some(addr);
    }
}

impl fmt::Debug for HandleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleEntry")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .field("watermarks", &self.watermarks())
            .finish()
    }
}
