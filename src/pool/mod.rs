//! Session pool
//!
//! [`SessionPool`] is the public entry point: it owns the worker threads and
//! the handle table, and turns listeners, connectors and imported sockets
//! into managed sessions.

mod guard;
mod listener;
mod manager;
mod worker;

pub(crate) use guard::{ConnectionLimiter, ConnectionSlot};
pub use manager::{PoolStats, PoolStatsSnapshot};

use crate::channel::driver::{run_session, DriverContext};
use crate::channel::Watermarks;
use crate::config::{Config, PoolConfig};
use crate::connector::{AttemptState, ConnectOptions, ConnectOutcome, ConnectionAttemptController};
use crate::error::PoolError;
use crate::handle::{
    HandleEntry, HandleId, HandleKind, HandleTable, PoolState, PoolStateCallback, SessionState,
    SessionStateCallback, UserData,
};
use crate::helper::DEFAULT_BACKLOG;
use crate::session::{Session, SessionFactory};
use crate::transport::{AddrMaybeCached, SocketOpts, TcpTransport, Transport};
use listener::run_listener;
use manager::PoolManager;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker::WorkerPool;

/// Parameters of [`SessionPool::listen`]
#[derive(Clone)]
pub struct ListenOptions {
    /// Accept backlog
    pub backlog: u32,
    /// Socket options for the listener and accepted connections
    pub socket_opts: Option<SocketOpts>,
    /// Passed back to callbacks of the listener and its sessions
    pub user_data: Option<UserData>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        ListenOptions {
            backlog: DEFAULT_BACKLOG,
            socket_opts: None,
            user_data: None,
        }
    }
}

impl ListenOptions {
    /// Options with the given backlog
    pub fn new(backlog: u32) -> Self {
        ListenOptions {
            backlog,
            ..Default::default()
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = Some(opts);
        self
    }

    /// Attach user data
    pub fn with_user_data(mut self, user_data: UserData) -> Self {
        self.user_data = Some(user_data);
        self
    }
}

impl fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenOptions")
            .field("backlog", &self.backlog)
            .field("socket_opts", &self.socket_opts)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

/// State shared between the facade and the tasks it spawns
pub(crate) struct PoolShared<T: Transport> {
    config: PoolConfig,
    transport: Arc<T>,
    table: Arc<HandleTable<HandleEntry>>,
    limiter: Arc<ConnectionLimiter>,
    stats: Arc<PoolStats>,
    pool_callback: PoolStateCallback,
    /// Serializes pool callbacks; reentrant so a callback may call back into the pool
    callback_lock: ReentrantMutex<()>,
    workers: RwLock<Option<Arc<WorkerPool>>>,
    root: Mutex<CancellationToken>,
}

impl<T: Transport> PoolShared<T> {
    fn running(&self) -> Result<Arc<WorkerPool>, PoolError> {
        self.workers.read().clone().ok_or(PoolError::NotRunning)
    }

    pub(crate) fn notify_pool(
        &self,
        state: PoolState,
        source: Option<HandleId>,
        user_data: Option<&UserData>,
    ) {
        let _guard = self.callback_lock.lock();
        (self.pool_callback)(state, source, user_data);
    }

    /// Report a refusal due to the connection limit
    fn limit_reached(&self, source: Option<HandleId>, user_data: Option<&UserData>) -> PoolError {
        self.stats.record_rejected();
        self.notify_pool(PoolState::SessionLimitReached, source, user_data);
        PoolError::SessionLimitReached(self.limiter.max())
    }

    fn insert_entry(
        &self,
        kind: HandleKind,
        callback: SessionStateCallback,
        factory: Arc<dyn SessionFactory>,
        user_data: Option<UserData>,
        watermarks: Watermarks,
        attempt: Option<Arc<AttemptState>>,
    ) -> Arc<HandleEntry> {
        let cancel = self.root.lock().child_token();
        let (_, entry) = self.table.insert_with(|id| {
            let entry =
                HandleEntry::new(id, kind, callback, factory, user_data, cancel, watermarks);
            match attempt {
                Some(attempt) => entry.with_attempt(attempt),
                None => entry,
            }
        });
        entry
    }

    fn driver_context(&self, slot: ConnectionSlot) -> DriverContext {
        DriverContext {
            table: self.table.clone(),
            stats: self.stats.clone(),
            sizes: self.config.incoming_message_sizes,
            slot,
        }
    }
}

/// Run a connector to completion, then its session if it connected
async fn run_connector<T: Transport>(
    shared: Arc<PoolShared<T>>,
    entry: Arc<HandleEntry>,
    mut controller: ConnectionAttemptController<T>,
    slot: ConnectionSlot,
) {
    let outcome = controller
        .run(|_, _| entry.notify(SessionState::ConnectAttemptFailed, None))
        .await;
    debug!(
        "Connector {} finished after {} attempt(s)",
        entry.id(),
        controller.attempts()
    );

    match outcome {
        ConnectOutcome::Established { stream, addr } => {
            let peer = T::peer_addr(&stream).or(Some(addr));
            run_session(entry, stream, peer, shared.driver_context(slot)).await;
        }
        ConnectOutcome::Failed(_) => {
            shared.stats.record_connect_failed();
            shared.table.remove(entry.id());
            drop(slot);
            entry.notify(SessionState::ConnectFailed, None);
            shared.notify_pool(PoolState::ConnectFailed, Some(entry.id()), entry.user_data());
        }
        ConnectOutcome::Aborted => {
            shared.table.remove(entry.id());
            drop(slot);
            entry.notify(SessionState::ConnectAborted, None);
        }
    }
}

/// Callback-driven pool of sessions over a byte-stream transport
///
/// All calls except [`stop`](Self::stop) and
/// [`stop_and_remove_all_sessions`](Self::stop_and_remove_all_sessions)
/// return immediately; outcomes are reported through the session and pool
/// callbacks. Callbacks for one handle are delivered in order on the worker
/// thread the handle is pinned to.
pub struct SessionPool<T: Transport = TcpTransport> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Transport> SessionPool<T> {
    /// Create a stopped pool
    pub fn new<F>(config: PoolConfig, transport: T, pool_callback: F) -> Result<Self, PoolError>
    where
        F: Fn(PoolState, Option<HandleId>, Option<&UserData>) + Send + Sync + 'static,
    {
        config.validate().map_err(PoolError::Config)?;

        let limiter = Arc::new(ConnectionLimiter::new(config.max_connections));
        Ok(SessionPool {
            shared: Arc::new(PoolShared {
                config,
                transport: Arc::new(transport),
                table: Arc::new(HandleTable::new()),
                limiter,
                stats: Arc::new(PoolStats::new()),
                pool_callback: Arc::new(pool_callback),
                callback_lock: ReentrantMutex::new(()),
                workers: RwLock::new(None),
                root: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    /// Create a stopped pool and its transport from a configuration
    pub fn from_config<F>(config: &Config, pool_callback: F) -> Result<Self, PoolError>
    where
        F: Fn(PoolState, Option<HandleId>, Option<&UserData>) + Send + Sync + 'static,
    {
        let transport = T::new(&config.transport).map_err(PoolError::Transport)?;
        Self::new(config.pool.clone(), transport, pool_callback)
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Transport used by this pool
    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// Start the worker threads; does nothing if already running
    pub fn start(&self) -> Result<(), PoolError> {
        let mut workers = self.shared.workers.write();
        if workers.is_some() {
            return Ok(());
        }

        let pool = Arc::new(WorkerPool::start(self.shared.config.max_threads)?);
        let root = CancellationToken::new();
        *self.shared.root.lock() = root.clone();

        if let Some(interval) = self.shared.config.metrics_interval() {
            let manager = PoolManager::new(
                self.shared.stats.clone(),
                self.shared.table.clone(),
                Arc::downgrade(&pool),
                interval,
            );
            pool.spawn_on(0, manager.run(root.child_token()));
        }

        info!(
            "Session pool started with {} worker(s), max {} connection(s)",
            pool.len(),
            self.shared.config.max_connections
        );
        *workers = Some(pool);
        Ok(())
    }

    /// Close every handle and wait for the workers to drain
    ///
    /// Terminal callbacks (`Down`, `ConnectAborted`) are delivered before
    /// this returns. Returns [`PoolError::ShutdownTimeout`] if a worker did
    /// not exit within the configured grace period; the pool is stopped
    /// regardless. Stopping a stopped pool does nothing.
    pub fn stop(&self) -> Result<(), PoolError> {
        let workers = match self.shared.workers.write().take() {
            Some(workers) => workers,
            None => return Ok(()),
        };

        info!("Stopping session pool ({} handle(s))", self.shared.table.len());
        self.shared.table.for_each(|_, entry| {
            entry.request_close();
        });
        self.shared.root.lock().cancel();

        match workers.shutdown(self.shared.config.shutdown_timeout()) {
            0 => {
                info!("Session pool stopped");
                Ok(())
            }
            stuck => Err(PoolError::ShutdownTimeout(stuck)),
        }
    }

    /// Stop the pool and destroy every handle that is still left
    ///
    /// Returns [`PoolError::ForcedCleanup`] (a negative code) if any handle
    /// had to be removed forcibly or a session failed to stop.
    pub fn stop_and_remove_all_sessions(&self) -> Result<(), PoolError> {
        let stop_failures_before = self.shared.stats.snapshot().stop_failures;
        let stopped = self.stop();

        let leftovers = self.shared.table.drain();
        for (id, entry) in &leftovers {
            debug!("Forcibly removing handle {}", id);
            entry.request_close();
            if let Some(channel) = entry.detach_channel() {
                channel.mark_down();
            }
        }

        let stop_failures = self.shared.stats.snapshot().stop_failures - stop_failures_before;
        let forced = leftovers.len() + stop_failures;
        if forced > 0 {
            warn!(
                "Forced cleanup: {} handle(s) removed, {} session stop failure(s)",
                leftovers.len(),
                stop_failures
            );
            return Err(PoolError::ForcedCleanup(forced));
        }
        stopped
    }

    /// Whether the pool has been started and not stopped
    pub fn is_running(&self) -> bool {
        self.shared.workers.read().is_some()
    }

    /// Listen for connections on `addr`
    ///
    /// Every accepted connection becomes a new established handle reported
    /// through `callback`. Binding happens before this returns, so
    /// [`listen_addr`](Self::listen_addr) is immediately available.
    pub fn listen<F>(
        &self,
        addr: SocketAddr,
        factory: Arc<dyn SessionFactory>,
        callback: F,
        options: ListenOptions,
    ) -> Result<HandleId, PoolError>
    where
        F: Fn(SessionState, HandleId, Option<&dyn Session>, Option<&UserData>)
            + Send
            + Sync
            + 'static,
    {
        let shared = &self.shared;
        let workers = shared.running()?;
        if shared.limiter.is_full() {
            return Err(shared.limit_reached(None, options.user_data.as_ref()));
        }

        let index = workers.pick();
        let listener = workers
            .enter(index, || {
                shared
                    .transport
                    .bind(addr, options.backlog, options.socket_opts.as_ref())
            })
            .map_err(PoolError::Transport)?;
        let local_addr = T::local_addr(&listener).map_err(PoolError::Transport)?;

        let entry = shared.insert_entry(
            HandleKind::Listener,
            Arc::new(callback),
            factory,
            options.user_data,
            shared.config.watermarks(),
            None,
        );
        entry.set_local_addr(local_addr);
        let id = entry.id();

        workers.spawn_on(index, run_listener(shared.clone(), entry, listener));
        info!("Listening on {} (handle {})", local_addr, id);
        Ok(id)
    }

    /// Connect to `target`, retrying as described by `options`
    pub fn connect<A, F>(
        &self,
        target: A,
        factory: Arc<dyn SessionFactory>,
        callback: F,
        options: ConnectOptions,
    ) -> Result<HandleId, PoolError>
    where
        A: Into<AddrMaybeCached>,
        F: Fn(SessionState, HandleId, Option<&dyn Session>, Option<&UserData>)
            + Send
            + Sync
            + 'static,
    {
        options.validate()?;
        let shared = &self.shared;
        let workers = shared.running()?;
        let slot = match shared.limiter.try_acquire() {
            Some(slot) => slot,
            None => return Err(shared.limit_reached(None, options.user_data.as_ref())),
        };

        let target = target.into();
        let attempt = Arc::new(AttemptState::new());
        let entry = shared.insert_entry(
            HandleKind::Connector,
            Arc::new(callback),
            factory,
            options.user_data.clone(),
            shared.config.watermarks(),
            Some(attempt.clone()),
        );
        let id = entry.id();
        debug!("Connecting to {} (handle {})", target.addr(), id);

        let controller = ConnectionAttemptController::new(
            shared.transport.clone(),
            target,
            &options,
            attempt,
            entry.cancel_token().clone(),
        );
        workers.spawn(run_connector(shared.clone(), entry, controller, slot));
        Ok(id)
    }

    /// Manage an already connected stream
    pub fn import<F>(
        &self,
        stream: T::Stream,
        factory: Arc<dyn SessionFactory>,
        callback: F,
        user_data: Option<UserData>,
    ) -> Result<HandleId, PoolError>
    where
        F: Fn(SessionState, HandleId, Option<&dyn Session>, Option<&UserData>)
            + Send
            + Sync
            + 'static,
    {
        let workers = self.shared.running()?;
        let index = workers.pick();
        let stream = workers
            .enter(index, || self.shared.transport.reregister(stream))
            .map_err(PoolError::Transport)?;
        self.import_on(&workers, index, stream, factory, Arc::new(callback), user_data)
    }

    fn import_on(
        &self,
        workers: &WorkerPool,
        index: usize,
        stream: T::Stream,
        factory: Arc<dyn SessionFactory>,
        callback: SessionStateCallback,
        user_data: Option<UserData>,
    ) -> Result<HandleId, PoolError> {
        let shared = &self.shared;
        let slot = match shared.limiter.try_acquire() {
            Some(slot) => slot,
            None => return Err(shared.limit_reached(None, user_data.as_ref())),
        };

        let peer = T::peer_addr(&stream);
        let entry = shared.insert_entry(
            HandleKind::Imported,
            callback,
            factory,
            user_data,
            shared.config.watermarks(),
            None,
        );
        let id = entry.id();
        debug!("Imported stream as handle {}", id);

        let ctx = shared.driver_context(slot);
        workers.spawn_on(index, run_session(entry, stream, peer, ctx));
        Ok(id)
    }

    /// Close a handle
    ///
    /// A connector is aborted, a session is stopped and a listener stops
    /// accepting. The handle is removed asynchronously, after its terminal
    /// callback. Closing a handle twice returns [`PoolError::HandleNotFound`].
    pub fn close_handle(&self, id: HandleId) -> Result<(), PoolError> {
        let entry = self
            .shared
            .table
            .get(id)
            .ok_or(PoolError::HandleNotFound(id))?;
        if !entry.request_close() {
            return Err(PoolError::HandleNotFound(id));
        }
        debug!("Closing handle {} ({:?})", id, entry.kind());
        Ok(())
    }

    /// Change the write-cache watermarks of a handle
    ///
    /// Takes effect immediately for an established session, which may fire
    /// a watermark callback right away. On a listener it sets the
    /// watermarks future accepted sessions start with.
    pub fn set_write_cache_watermarks(
        &self,
        id: HandleId,
        low: usize,
        high: usize,
    ) -> Result<(), PoolError> {
        let watermarks = Watermarks::new(low, high)?;
        let entry = self
            .shared
            .table
            .get(id)
            .ok_or(PoolError::HandleNotFound(id))?;
        entry.set_watermarks(watermarks);
        Ok(())
    }

    /// Number of established sessions
    pub fn num_sessions(&self) -> usize {
        let mut count = 0;
        self.shared.table.for_each(|_, entry| {
            if entry.kind() == HandleKind::Established {
                count += 1;
            }
        });
        count
    }

    /// Number of live handles of any kind
    pub fn num_handles(&self) -> usize {
        self.shared.table.len()
    }

    /// Current role of a handle, `None` once it has been removed
    pub fn handle_kind(&self, id: HandleId) -> Option<HandleKind> {
        self.shared.table.get(id).map(|entry| entry.kind())
    }

    /// Address a listener handle is bound to
    pub fn listen_addr(&self, id: HandleId) -> Result<SocketAddr, PoolError> {
        let entry = self
            .shared
            .table
            .get(id)
            .ok_or(PoolError::HandleNotFound(id))?;
        entry
            .local_addr()
            .ok_or_else(|| PoolError::InvalidArgument(format!("handle {} is not a listener", id)))
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl SessionPool<TcpTransport> {
    /// Manage an already connected standard library TCP stream
    pub fn import_std<F>(
        &self,
        stream: std::net::TcpStream,
        factory: Arc<dyn SessionFactory>,
        callback: F,
        user_data: Option<UserData>,
    ) -> Result<HandleId, PoolError>
    where
        F: Fn(SessionState, HandleId, Option<&dyn Session>, Option<&UserData>)
            + Send
            + Sync
            + 'static,
    {
        let workers = self.shared.running()?;
        if self.shared.limiter.is_full() {
            return Err(self.shared.limit_reached(None, user_data.as_ref()));
        }

        let index = workers.pick();
        stream.set_nonblocking(true)?;
        let stream = workers.enter(index, || tokio::net::TcpStream::from_std(stream))?;
        self.import_on(&workers, index, stream, factory, Arc::new(callback), user_data)
    }
}

impl<T: Transport> fmt::Debug for SessionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("running", &self.is_running())
            .field("handles", &self.num_handles())
            .field("transport", &self.shared.transport)
            .finish()
    }
}

impl<T: Transport> Drop for SessionPool<T> {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop_and_remove_all_sessions() {
                warn!("Session pool dropped while running: {}", e);
            }
        }
    }
}
