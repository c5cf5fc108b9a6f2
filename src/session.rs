//! Client-supplied session protocol
//!
//! A [`Session`] is the application-level behavior attached to one
//! established channel. Sessions are produced asynchronously by a
//! [`SessionFactory`]; the pool only starts, stops and hands them back for
//! deallocation.

use crate::channel::AsyncChannel;
use anyhow::Result;

/// Application behavior over one established channel
pub trait Session: Send + 'static {
    /// Begin the asynchronous operation of this session
    ///
    /// Called once on the channel's worker right after allocation. An error
    /// aborts the handle with [`SessionState::StartupFailed`](crate::SessionState::StartupFailed).
    fn start(&mut self) -> Result<()>;

    /// Stop the operation of this session
    fn stop(&mut self) -> Result<()>;

    /// The channel this session runs on
    fn channel(&self) -> &AsyncChannel;
}

/// Completion callback for [`SessionFactory::allocate`]
pub type AllocateCallback = Box<dyn FnOnce(Result<Box<dyn Session>>) + Send + 'static>;

/// Allocator and deallocator of sessions
///
/// `allocate` may complete later and from any thread, which lets a factory
/// do its own I/O or pooling before handing out a session. Callbacks for the
/// connection are held back until the allocation completes.
pub trait SessionFactory: Send + Sync + 'static {
    /// Allocate a session for `channel` and invoke `callback` with it
    fn allocate(&self, channel: AsyncChannel, callback: AllocateCallback);

    /// Release a session previously produced by this factory
    fn deallocate(&self, session: Box<dyn Session>) {
        drop(session);
    }
}
