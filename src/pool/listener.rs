//! Accept loop of a listener handle

use super::PoolShared;
use crate::channel::driver::run_session;
use crate::handle::{HandleEntry, HandleKind, PoolState, SessionState};
use crate::helper::ACCEPT_RETRY_DELAY;
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Accept connections until the listener is closed
///
/// Closing a listener is silent: it is removed from the table without a
/// session callback.
pub(crate) async fn run_listener<T: Transport>(
    shared: Arc<PoolShared<T>>,
    entry: Arc<HandleEntry>,
    listener: T::Listener,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = entry.cancelled() => break,
            accepted = shared.transport.accept(&listener) => accepted,
        };

        match accepted {
            Ok((stream, peer)) => accept_connection(&shared, &entry, stream, peer),
            Err(e) => {
                warn!("Listener {} failed to accept: {:#}", entry.id(), e);
                entry.notify(SessionState::AcceptFailed, None);
                shared.notify_pool(PoolState::AcceptFailed, Some(entry.id()), entry.user_data());

                tokio::select! {
                    biased;
                    _ = entry.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }

    drop(listener);
    shared.table.remove(entry.id());
    debug!("Listener {} closed", entry.id());
}

/// Turn an accepted connection into an established handle
fn accept_connection<T: Transport>(
    shared: &Arc<PoolShared<T>>,
    listener: &HandleEntry,
    stream: T::Stream,
    peer: SocketAddr,
) {
    shared.stats.record_accepted();

    let workers = match shared.running() {
        Ok(workers) => workers,
        Err(_) => {
            debug!(
                "Dropping connection from {} on listener {}: pool is stopping",
                peer,
                listener.id()
            );
            return;
        }
    };

    let slot = match shared.limiter.try_acquire() {
        Some(slot) => slot,
        None => {
            warn!(
                "Rejecting connection from {} on listener {}: limit of {} reached",
                peer,
                listener.id(),
                shared.limiter.max()
            );
            shared.limit_reached(Some(listener.id()), listener.user_data());
            return;
        }
    };

    // The stream was accepted on the listener's worker; move it to the
    // worker its session will be pinned to
    let index = workers.pick();
    let stream = match workers.enter(index, || shared.transport.reregister(stream)) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Dropping connection from {} on listener {}: {:#}",
                peer,
                listener.id(),
                e
            );
            return;
        }
    };

    // Accepted sessions start out with the listener's settings
    let entry = shared.insert_entry(
        HandleKind::Established,
        listener.callback().clone(),
        listener.factory().clone(),
        listener.user_data().cloned(),
        listener.watermarks(),
        None,
    );
    debug!("Accepted {} on listener {} as {}", peer, listener.id(), entry.id());

    let ctx = shared.driver_context(slot);
    workers.spawn_on(index, run_session(entry, stream, Some(peer), ctx));
}
