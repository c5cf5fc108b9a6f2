//! Test utilities and mocks for sessionpool
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sessionpool::config::TransportConfig;
use sessionpool::{
    AllocateCallback, AsyncChannel, HandleId, PoolConfig, PoolState, Session, SessionFactory,
    SessionPool, SessionState, SocketOpts, Transport, UserData,
};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, Notify};

/// Upper bound for waiting on asynchronous pool events
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it holds or `timeout` elapses
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Pool configuration for tests: no health logging, short grace period
pub fn test_config(max_threads: usize, max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_threads,
        max_connections,
        metrics_interval: 0,
        shutdown_timeout: 5,
        ..Default::default()
    }
}

/// Scripted outcome of one connect call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    /// Fail immediately
    Fail,
    /// Succeed immediately
    Succeed,
    /// Succeed once the gate is opened
    Gate,
}

/// Listener produced by [`MockTransport::bind`]
#[derive(Debug)]
pub struct MockListener {
    addr: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>>,
}

/// In-memory transport over duplex pipes
#[derive(Debug)]
pub struct MockTransport {
    script: Mutex<VecDeque<ConnectStep>>,
    default_step: ConnectStep,
    buffer_size: usize,
    gate: Notify,
    next_port: AtomicU16,
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(DuplexStream, SocketAddr)>>>,
    peers: Mutex<VecDeque<DuplexStream>>,
    connected_to: Mutex<Vec<SocketAddr>>,
    /// Number of connect calls
    pub connects: AtomicUsize,
    /// Number of resolve calls
    pub resolves: AtomicUsize,
    /// Accept calls that fail before one blocks
    pub fail_accepts: AtomicUsize,
}

impl MockTransport {
    /// Transport whose connects all behave like `default_step`
    pub fn new_with(default_step: ConnectStep) -> Self {
        MockTransport {
            script: Mutex::new(VecDeque::new()),
            default_step,
            buffer_size: 8192,
            gate: Notify::new(),
            next_port: AtomicU16::new(40000),
            listeners: Mutex::new(HashMap::new()),
            peers: Mutex::new(VecDeque::new()),
            connected_to: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            fail_accepts: AtomicUsize::new(0),
        }
    }

    /// Transport following `steps`, then `default_step`
    pub fn scripted(steps: &[ConnectStep], default_step: ConnectStep) -> Self {
        let transport = Self::new_with(default_step);
        transport.script.lock().extend(steps.iter().copied());
        transport
    }

    /// Set the capacity of the duplex pipes
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Let one gated connect complete
    pub fn open_gate(&self) {
        self.gate.notify_one();
    }

    /// Remote end of the oldest successful connect
    pub fn take_peer(&self) -> Option<DuplexStream> {
        self.peers.lock().pop_front()
    }

    /// Addresses passed to connect, in order
    pub fn connected_to(&self) -> Vec<SocketAddr> {
        self.connected_to.lock().clone()
    }

    /// Open a connection to a bound listener, returning the client end
    pub fn dial(&self, addr: SocketAddr) -> Option<DuplexStream> {
        let (client, server) = duplex(self.buffer_size);
        let listeners = self.listeners.lock();
        let sender = listeners.get(&addr)?;
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000);
        sender.send((server, peer)).ok()?;
        Some(client)
    }

    fn make_pair(&self) -> DuplexStream {
        let (local, remote) = duplex(self.buffer_size);
        self.peers.lock().push_back(remote);
        local
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Stream = DuplexStream;
    type Listener = MockListener;

    fn new(_config: &TransportConfig) -> Result<Self> {
        Ok(MockTransport::new_with(ConnectStep::Succeed))
    }

    fn peer_addr(_conn: &Self::Stream) -> Option<SocketAddr> {
        None
    }

    fn bind(
        &self,
        addr: SocketAddr,
        _backlog: u32,
        _opts: Option<&SocketOpts>,
    ) -> Result<Self::Listener> {
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.next_port.fetch_add(1, Ordering::SeqCst))
        } else {
            addr
        };

        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&addr) {
            return Err(anyhow!("address in use: {}", addr));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr, tx);

        Ok(MockListener {
            addr,
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    fn local_addr(listener: &Self::Listener) -> Result<SocketAddr> {
        Ok(listener.addr)
    }

    async fn accept(&self, listener: &Self::Listener) -> Result<(Self::Stream, SocketAddr)> {
        let failing = self
            .fail_accepts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("accept failed"));
        }

        listener
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("listener closed"))
    }

    async fn connect(&self, addr: SocketAddr, _opts: Option<&SocketOpts>) -> Result<Self::Stream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected_to.lock().push(addr);

        let step = self.script.lock().pop_front().unwrap_or(self.default_step);
        match step {
            ConnectStep::Fail => Err(anyhow!("connection refused by {}", addr)),
            ConnectStep::Succeed => Ok(self.make_pair()),
            ConnectStep::Gate => {
                self.gate.notified().await;
                Ok(self.make_pair())
            }
        }
    }

    async fn resolve(&self, host: &str) -> Result<SocketAddr> {
        let count = self.resolves.fetch_add(1, Ordering::SeqCst);
        let port: u16 = host
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| anyhow!("bad host: {}", host))?;
        // Each lookup answers with a different address
        Ok(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, (count % 250) as u8 + 1)),
            port,
        ))
    }
}

/// Create a mock-backed pool reporting pool events to `recorder`
pub fn mock_pool(
    config: PoolConfig,
    transport: MockTransport,
    recorder: &Recorder,
) -> SessionPool<MockTransport> {
    SessionPool::new(config, transport, recorder.pool_callback()).unwrap()
}

/// Records every callback the pool delivers
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(HandleId, SessionState)>>>,
    pool_events: Arc<Mutex<Vec<(PoolState, Option<HandleId>)>>>,
    channels: Arc<Mutex<HashMap<HandleId, AsyncChannel>>>,
    user_data: Arc<Mutex<Vec<(HandleId, Option<u32>)>>>,
}

impl Recorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Session callback feeding this recorder
    pub fn session_callback(
        &self,
    ) -> impl Fn(SessionState, HandleId, Option<&dyn Session>, Option<&UserData>) + Send + Sync + 'static
    {
        let recorder = self.clone();
        move |state, id, session, user_data| {
            if state == SessionState::Up {
                if let Some(session) = session {
                    recorder
                        .channels
                        .lock()
                        .insert(id, session.channel().clone());
                }
            }
            let tag = user_data.and_then(|data| data.downcast_ref::<u32>().copied());
            recorder.user_data.lock().push((id, tag));
            recorder.events.lock().push((id, state));
        }
    }

    /// Pool callback feeding this recorder
    pub fn pool_callback(
        &self,
    ) -> impl Fn(PoolState, Option<HandleId>, Option<&UserData>) + Send + Sync + 'static {
        let recorder = self.clone();
        move |state, source, _| {
            recorder.pool_events.lock().push((state, source));
        }
    }

    /// Every session event in delivery order
    pub fn events(&self) -> Vec<(HandleId, SessionState)> {
        self.events.lock().clone()
    }

    /// Session states delivered for one handle
    pub fn states(&self, id: HandleId) -> Vec<SessionState> {
        self.events
            .lock()
            .iter()
            .filter(|(handle, _)| *handle == id)
            .map(|(_, state)| *state)
            .collect()
    }

    /// Number of times `state` was delivered, across all handles
    pub fn count(&self, state: SessionState) -> usize {
        self.events.lock().iter().filter(|(_, s)| *s == state).count()
    }

    /// Handles that reached `Up`
    pub fn up_handles(&self) -> Vec<HandleId> {
        self.events
            .lock()
            .iter()
            .filter(|(_, s)| *s == SessionState::Up)
            .map(|(id, _)| *id)
            .collect()
    }

    /// User data tags seen by the session callback
    pub fn user_data_tags(&self) -> Vec<(HandleId, Option<u32>)> {
        self.user_data.lock().clone()
    }

    /// Pool events in delivery order
    pub fn pool_events(&self) -> Vec<(PoolState, Option<HandleId>)> {
        self.pool_events.lock().clone()
    }

    /// Channel of a session that came up
    pub fn channel(&self, id: HandleId) -> Option<AsyncChannel> {
        self.channels.lock().get(&id).cloned()
    }

    /// Wait until `state` has been delivered `count` times
    pub fn wait_for(&self, state: SessionState, count: usize) -> bool {
        wait_until(WAIT, || self.count(state) >= count)
    }
}

/// Session used by [`TestFactory`]
pub struct TestSession {
    channel: AsyncChannel,
    factory: Arc<TestFactory>,
}

impl Session for TestSession {
    fn start(&mut self) -> Result<()> {
        if self.factory.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("start refused"));
        }
        if self.factory.read_on_start.load(Ordering::SeqCst) {
            // Discard everything; reading lets the driver see the peer go away
            self.channel.read(1, |buf| {
                buf.clear();
                1
            })?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.factory.stopped.fetch_add(1, Ordering::SeqCst);
        let delay = self.factory.stop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            // Blocks the worker thread
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.factory.fail_stop.load(Ordering::SeqCst) {
            return Err(anyhow!("stop refused"));
        }
        Ok(())
    }

    fn channel(&self) -> &AsyncChannel {
        &self.channel
    }
}

/// Factory with switchable failures and allocation counters
#[derive(Default)]
pub struct TestFactory {
    /// Fail every allocation
    pub fail_alloc: AtomicBool,
    /// Make every session fail to start
    pub fail_start: AtomicBool,
    /// Make every session fail to stop
    pub fail_stop: AtomicBool,
    /// Register a discarding read when a session starts
    pub read_on_start: AtomicBool,
    /// Milliseconds `Session::stop` blocks its worker for
    pub stop_delay_ms: AtomicU64,
    /// Hold allocations until [`TestFactory::complete_deferred`]
    pub defer_alloc: AtomicBool,
    /// Sessions handed out
    pub allocated: AtomicUsize,
    /// Sessions handed back
    pub deallocated: AtomicUsize,
    /// Calls to `Session::stop`
    pub stopped: AtomicUsize,
    deferred: Mutex<Vec<(AsyncChannel, AllocateCallback)>>,
    this: Mutex<Option<std::sync::Weak<TestFactory>>>,
}

impl TestFactory {
    /// Create a factory that succeeds by default
    pub fn new() -> Arc<Self> {
        let factory = Arc::new(TestFactory::default());
        *factory.this.lock() = Some(Arc::downgrade(&factory));
        factory
    }

    /// Number of allocations waiting to complete
    pub fn num_deferred(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Complete every deferred allocation with a session
    pub fn complete_deferred(&self) {
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for (channel, callback) in deferred {
            self.finish(channel, callback);
        }
    }

    fn finish(&self, channel: AsyncChannel, callback: AllocateCallback) {
        if self.fail_alloc.load(Ordering::SeqCst) {
            callback(Err(anyhow!("out of sessions")));
            return;
        }
        let factory = match self.this.lock().as_ref().and_then(|weak| weak.upgrade()) {
            Some(factory) => factory,
            None => {
                callback(Err(anyhow!("factory gone")));
                return;
            }
        };
        self.allocated.fetch_add(1, Ordering::SeqCst);
        callback(Ok(Box::new(TestSession { channel, factory })));
    }
}

impl SessionFactory for TestFactory {
    fn allocate(&self, channel: AsyncChannel, callback: AllocateCallback) {
        if self.defer_alloc.load(Ordering::SeqCst) {
            self.deferred.lock().push((channel, callback));
            return;
        }
        self.finish(channel, callback);
    }

    fn deallocate(&self, session: Box<dyn Session>) {
        self.deallocated.fetch_add(1, Ordering::SeqCst);
        drop(session);
    }
}
