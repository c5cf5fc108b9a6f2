//! Established channels
//!
//! An [`AsyncChannel`] is the client-facing view of one established
//! connection. It is a cheap-to-clone handle: every operation is turned into
//! a command for the connection's driver task, which owns the socket and
//! delivers all callbacks for the connection in order.

pub(crate) mod driver;
mod watermark;

pub use watermark::{WatermarkEvent, Watermarks, WriteCacheMonitor};

use crate::error::ChannelError;
use crate::handle::HandleId;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Read callback registered with [`AsyncChannel::read`]
///
/// Receives the buffered incoming bytes, consumes what it needs (for example
/// with `split_to`), and returns the number of buffered bytes required before
/// it is invoked again. Returning `0` stops reading.
pub type ReadCallback = Box<dyn FnMut(&mut BytesMut) -> usize + Send + 'static>;

/// Commands sent from channel handles to the driver task
pub(crate) enum ChannelCommand {
    Write(Bytes),
    Read {
        num_needed: usize,
        callback: ReadCallback,
    },
    CancelRead,
    SetWatermarks(Watermarks),
    Close,
}

impl fmt::Debug for ChannelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelCommand::Write(data) => write!(f, "Write({} bytes)", data.len()),
            ChannelCommand::Read { num_needed, .. } => write!(f, "Read({})", num_needed),
            ChannelCommand::CancelRead => write!(f, "CancelRead"),
            ChannelCommand::SetWatermarks(marks) => write!(f, "SetWatermarks({:?})", marks),
            ChannelCommand::Close => write!(f, "Close"),
        }
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const DOWN: u8 = 2;

struct ChannelShared {
    handle: HandleId,
    peer_addr: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: AtomicU8,
}

/// Handle onto one established connection
#[derive(Clone)]
pub struct AsyncChannel {
    inner: Arc<ChannelShared>,
}

impl AsyncChannel {
    /// Create a channel handle and the command receiver for its driver
    pub(crate) fn new(
        handle: HandleId,
        peer_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let channel = AsyncChannel {
            inner: Arc::new(ChannelShared {
                handle,
                peer_addr,
                commands,
                state: AtomicU8::new(OPEN),
            }),
        };
        (channel, rx)
    }

    /// Id of the handle this channel belongs to
    pub fn handle(&self) -> HandleId {
        self.inner.handle
    }

    /// Address of the remote peer, when the transport knows it
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Whether the channel no longer accepts operations
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != OPEN
    }

    /// Queue `data` for writing
    ///
    /// Queued bytes count against the write cache until they reach the
    /// socket; crossing the watermarks is reported through the session
    /// callback.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.check_open()?;
        self.send(ChannelCommand::Write(data.into()))
    }

    /// Start reading, invoking `callback` once `num_needed` bytes are buffered
    ///
    /// Replaces any previously registered read callback.
    pub fn read<F>(&self, num_needed: usize, callback: F) -> Result<(), ChannelError>
    where
        F: FnMut(&mut BytesMut) -> usize + Send + 'static,
    {
        self.check_open()?;
        self.send(ChannelCommand::Read {
            num_needed,
            callback: Box::new(callback),
        })
    }

    /// Stop delivering incoming data
    pub fn cancel_read(&self) -> Result<(), ChannelError> {
        self.check_open()?;
        self.send(ChannelCommand::CancelRead)
    }

    /// Close the channel after flushing queued writes
    ///
    /// The session goes down once the write queue has drained. Closing an
    /// already closed channel does nothing.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.inner.commands.send(ChannelCommand::Close);
        }
    }

    pub(crate) fn set_watermarks(&self, marks: Watermarks) {
        let _ = self.inner.commands.send(ChannelCommand::SetWatermarks(marks));
    }

    /// Mark the connection as gone; called by the driver on teardown
    pub(crate) fn mark_down(&self) {
        self.inner.state.store(DOWN, Ordering::Release);
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        match self.inner.state.load(Ordering::Acquire) {
            OPEN => Ok(()),
            CLOSING => Err(ChannelError::Closed),
            _ => Err(ChannelError::Disconnected),
        }
    }

    fn send(&self, cmd: ChannelCommand) -> Result<(), ChannelError> {
        self.inner
            .commands
            .send(cmd)
            .map_err(|_| ChannelError::Disconnected)
    }
}

impl fmt::Debug for AsyncChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncChannel")
            .field("handle", &self.inner.handle)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
