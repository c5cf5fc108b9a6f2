//! Per-connection driver task
//!
//! One driver runs for every established connection, on the worker the
//! connection is pinned to. It allocates and starts the session, moves bytes
//! between the socket and the [`AsyncChannel`], tracks the write cache, and
//! tears everything down exactly once.

use super::{AsyncChannel, ChannelCommand, ReadCallback, WriteCacheMonitor};
use crate::config::IncomingMessageSizes;
use crate::handle::{HandleEntry, HandleKind, HandleTable, SessionState};
use crate::pool::{ConnectionSlot, PoolStats};
use crate::session::Session;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Pool resources a driver needs
pub(crate) struct DriverContext {
    pub(crate) table: Arc<HandleTable<HandleEntry>>,
    pub(crate) stats: Arc<PoolStats>,
    pub(crate) sizes: IncomingMessageSizes,
    /// Released when the driver finishes
    pub(crate) slot: ConnectionSlot,
}

/// Read callback together with the byte count it waits for
pub(crate) struct PendingRead {
    num_needed: usize,
    callback: ReadCallback,
}

impl PendingRead {
    pub(crate) fn new(num_needed: usize, callback: ReadCallback) -> Self {
        PendingRead {
            num_needed: num_needed.max(1),
            callback,
        }
    }
}

enum WriterEvent {
    Flushed(usize),
    Failed(io::Error),
}

/// Why the run loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Closed through the channel; flush queued writes first
    Graceful,
    /// Closed through the pool
    Cancelled,
    /// The connection failed or the peer went away
    Disconnected,
}

/// Serve one established connection until it goes down
pub(crate) async fn run_session<S>(
    entry: Arc<HandleEntry>,
    stream: S,
    peer: Option<SocketAddr>,
    ctx: DriverContext,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    entry.set_kind(HandleKind::Established);
    let (channel, mut commands) = AsyncChannel::new(entry.id(), peer);

    let mut session = match allocate(&entry, &channel, &ctx).await {
        Some(session) => session,
        None => return,
    };

    if let Err(e) = session.start() {
        warn!("Session {} failed to start: {:#}", entry.id(), e);
        ctx.stats.record_startup_failed();
        channel.mark_down();
        ctx.table.remove(entry.id());
        entry.notify(SessionState::StartupFailed, Some(&*session));
        entry.factory().deallocate(session);
        return;
    }

    entry.attach_channel(channel.clone());
    ctx.stats.record_up();
    entry.notify(SessionState::Up, Some(&*session));

    let (mut reader, writer) = tokio::io::split(stream);
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Bytes>();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut writer_task = tokio::spawn(write_loop(writer, write_rx, event_tx));

    let mut monitor = WriteCacheMonitor::new(entry.watermarks());
    let mut read_buf = BytesMut::with_capacity(ctx.sizes.typical);
    let mut pending: Option<PendingRead> = None;

    let reason = loop {
        let want_read = pending.is_some();
        if let Some(read) = &pending {
            reserve_for_read(&mut read_buf, read.num_needed, &ctx.sizes);
        }

        tokio::select! {
            biased;
            _ = entry.cancelled() => break Teardown::Cancelled,
            cmd = commands.recv() => match cmd {
                Some(ChannelCommand::Write(data)) => {
                    let len = data.len();
                    if write_tx.send(data).is_err() {
                        break Teardown::Disconnected;
                    }
                    if let Some(event) = monitor.enqueue(len) {
                        entry.notify(event.into(), Some(&*session));
                    }
                }
                Some(ChannelCommand::Read { num_needed, callback }) => {
                    pending = Some(PendingRead::new(num_needed, callback));
                    deliver(&mut read_buf, &mut pending);
                }
                Some(ChannelCommand::CancelRead) => pending = None,
                Some(ChannelCommand::SetWatermarks(marks)) => {
                    if let Some(event) = monitor.set_watermarks(marks) {
                        entry.notify(event.into(), Some(&*session));
                    }
                }
                Some(ChannelCommand::Close) | None => break Teardown::Graceful,
            },
            event = events.recv() => match event {
                Some(WriterEvent::Flushed(n)) => {
                    ctx.stats.record_bytes_written(n);
                    if let Some(event) = monitor.dequeue(n) {
                        entry.notify(event.into(), Some(&*session));
                    }
                }
                Some(WriterEvent::Failed(e)) => {
                    debug!("Write on {} failed: {}", entry.id(), e);
                    break Teardown::Disconnected;
                }
                None => break Teardown::Disconnected,
            },
            read = reader.read_buf(&mut read_buf), if want_read => match read {
                Ok(0) => {
                    debug!("Peer closed {}", entry.id());
                    break Teardown::Disconnected;
                }
                Ok(_) => deliver(&mut read_buf, &mut pending),
                Err(e) => {
                    debug!("Read on {} failed: {}", entry.id(), e);
                    break Teardown::Disconnected;
                }
            },
        }
    };

    channel.mark_down();
    entry.detach_channel();
    drop(write_tx);

    if reason == Teardown::Graceful {
        // Flush what was queued before the close, unless the pool closes us first
        tokio::select! {
            biased;
            _ = entry.cancelled() => writer_task.abort(),
            _ = &mut writer_task => {}
        }
    } else {
        writer_task.abort();
    }

    if let Err(e) = session.stop() {
        warn!("Session {} failed to stop: {:#}", entry.id(), e);
        ctx.stats.record_stop_failed();
    }

    ctx.table.remove(entry.id());
    ctx.stats.record_down();
    debug!("Session {} down ({:?})", entry.id(), reason);
    entry.notify(SessionState::Down, Some(&*session));
    entry.factory().deallocate(session);
}

/// Ask the factory for a session, holding back everything else until it answers
async fn allocate(
    entry: &Arc<HandleEntry>,
    channel: &AsyncChannel,
    ctx: &DriverContext,
) -> Option<Box<dyn Session>> {
    let (tx, mut rx) = oneshot::channel();
    entry.factory().allocate(
        channel.clone(),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    let allocated = tokio::select! {
        biased;
        _ = entry.cancelled() => {
            // Closed before the session came up; whatever the factory
            // produces later goes straight back to it
            debug!("Handle {} closed during session allocation", entry.id());
            channel.mark_down();
            ctx.table.remove(entry.id());
            entry.notify(SessionState::ConnectAborted, None);
            let factory = entry.factory().clone();
            tokio::spawn(async move {
                if let Ok(Ok(session)) = rx.await {
                    factory.deallocate(session);
                }
            });
            return None;
        }
        result = &mut rx => result,
    };

    let error = match allocated {
        Ok(Ok(session)) => return Some(session),
        Ok(Err(e)) => e,
        Err(_) => anyhow::anyhow!("session factory dropped the allocation callback"),
    };

    warn!("Session allocation for {} failed: {:#}", entry.id(), error);
    ctx.stats.record_alloc_failed();
    channel.mark_down();
    ctx.table.remove(entry.id());
    entry.notify(SessionState::AllocFailed, None);
    None
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<WriterEvent>,
) where
    S: AsyncRead + AsyncWrite,
{
    while let Some(data) = queue.recv().await {
        match writer.write_all(&data).await {
            Ok(()) => {
                let _ = events.send(WriterEvent::Flushed(data.len()));
            }
            Err(e) => {
                let _ = events.send(WriterEvent::Failed(e));
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Make room for the next socket read
pub(crate) fn reserve_for_read(
    buf: &mut BytesMut,
    num_needed: usize,
    sizes: &IncomingMessageSizes,
) {
    if buf.capacity() - buf.len() >= sizes.min.max(1) {
        return;
    }
    let missing = num_needed.saturating_sub(buf.len());
    let want = missing.max(sizes.typical).min(sizes.max).max(1);
    buf.reserve(want);
}

/// Hand buffered bytes to the read callback while it is satisfied
pub(crate) fn deliver(buf: &mut BytesMut, pending: &mut Option<PendingRead>) {
    while let Some(read) = pending.as_mut() {
        if buf.len() < read.num_needed {
            return;
        }
        let before = buf.len();
        let next = (read.callback)(buf);
        if next == 0 {
            *pending = None;
            return;
        }
        // A callback that consumed nothing waits for more data
        read.num_needed = if buf.len() == before && next <= before {
            before + 1
        } else {
            next
        };
    }
}
