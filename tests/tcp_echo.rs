//! End-to-end tests over real TCP sockets with the echo session

mod common;

use anyhow::Result;
use common::{test_config, Recorder};
use sessionpool::echo::EchoSessionFactory;
use sessionpool::{
    AllocateCallback, AsyncChannel, ListenOptions, Session, SessionFactory, SessionPool,
    SessionState, TcpTransport,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Echo session that blocks its worker thread when it reads `block`
struct StallingEcho {
    channel: AsyncChannel,
}

impl Session for StallingEcho {
    fn start(&mut self) -> Result<()> {
        let channel = self.channel.clone();
        self.channel.read(1, move |buf| {
            let data = buf.split().freeze();
            if data.starts_with(b"block") {
                std::thread::sleep(Duration::from_secs(2));
            }
            let _ = channel.write(data);
            1
        })?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn channel(&self) -> &AsyncChannel {
        &self.channel
    }
}

struct StallingEchoFactory;

impl SessionFactory for StallingEchoFactory {
    fn allocate(&self, channel: AsyncChannel, callback: AllocateCallback) {
        callback(Ok(Box::new(StallingEcho { channel })));
    }
}

fn echo_pool(recorder: &Recorder) -> SessionPool<TcpTransport> {
    let pool = SessionPool::new(
        test_config(2, 16),
        TcpTransport::with_defaults(),
        recorder.pool_callback(),
    )
    .unwrap();
    pool.start().unwrap();
    pool
}

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

#[test]
fn test_tcp_echo_round_trip() {
    let recorder = Recorder::new();
    let pool = echo_pool(&recorder);
    let listener = pool
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(EchoSessionFactory::new()),
            recorder.session_callback(),
            ListenOptions::default(),
        )
        .unwrap();
    let addr = pool.listen_addr(listener).unwrap();

    let mut stream = client(addr);
    for message in [&b"hello pool"[..], &b"second message"[..]] {
        stream.write_all(message).unwrap();
        let mut buf = vec![0u8; message.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, message);
    }
    assert!(recorder.wait_for(SessionState::Up, 1));

    // Peer disconnect takes the session down
    drop(stream);
    assert!(recorder.wait_for(SessionState::Down, 1));
    assert_eq!(pool.num_sessions(), 0);
    assert_eq!(pool.num_handles(), 1);

    pool.stop().unwrap();
}

#[test]
fn test_tcp_one_shot_echo_closes_after_flush() {
    let recorder = Recorder::new();
    let pool = echo_pool(&recorder);
    let listener = pool
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(EchoSessionFactory::one_shot()),
            recorder.session_callback(),
            ListenOptions::default(),
        )
        .unwrap();
    let addr = pool.listen_addr(listener).unwrap();

    let mut stream = client(addr);
    stream.write_all(b"ping").unwrap();

    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"ping");
    assert!(recorder.wait_for(SessionState::Down, 1));
}

#[test]
fn test_tcp_import_std_stream() {
    let recorder = Recorder::new();
    let pool = echo_pool(&recorder);

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut stream = client(server.local_addr().unwrap());
    let (accepted, peer) = server.accept().unwrap();

    let id = pool
        .import_std(
            accepted,
            Arc::new(EchoSessionFactory::new()),
            recorder.session_callback(),
            None,
        )
        .unwrap();
    assert!(recorder.wait_for(SessionState::Up, 1));
    assert_eq!(recorder.channel(id).unwrap().peer_addr(), Some(peer));

    stream.write_all(b"imported").unwrap();
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"imported");

    assert!(pool.stop_and_remove_all_sessions().is_ok());
    assert_eq!(recorder.states(id), vec![SessionState::Up, SessionState::Down]);
}

#[test]
fn test_accepted_session_is_driven_by_its_own_worker() {
    let recorder = Recorder::new();
    let pool = echo_pool(&recorder);
    // The listener takes worker 0, so the first connection lands on worker 1
    // and the second one back on worker 0
    let listener = pool
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(StallingEchoFactory),
            recorder.session_callback(),
            ListenOptions::default(),
        )
        .unwrap();
    let addr = pool.listen_addr(listener).unwrap();

    let mut idle = client(addr);
    idle.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    idle.read_exact(&mut buf).unwrap();
    assert!(recorder.wait_for(SessionState::Up, 1));

    let mut busy = client(addr);
    assert!(recorder.wait_for(SessionState::Up, 2));
    busy.write_all(b"block").unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    idle.write_all(b"pong").unwrap();
    idle.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "echo took {:?} while another worker was blocked",
        started.elapsed()
    );

    let mut blocked = [0u8; 5];
    busy.read_exact(&mut blocked).unwrap();
    assert_eq!(&blocked, b"block");
}
