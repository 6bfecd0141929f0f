//! End-to-end forwarding over the in-memory tunnel
//!
//! A real TCP listener on 127.0.0.1:0 faces the clients; the tunnel side is
//! the loopback transport, whose remote end plays the forwarded service.

use sshfwd_forward::{
    ConfigError, Direction, ForwardError, ForwarderConfig, PairErrorPolicy, ShutdownCause,
    TunnelForwarder,
};
use sshfwd_transport::memory::{MemoryConnector, MemoryRemote, MemorySession};
use sshfwd_transport::{AuthMethod, Credentials};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn credentials() -> Credentials {
    Credentials::new("deploy", AuthMethod::Password("hunter2".to_string()))
}

fn config() -> ForwarderConfig {
    ForwarderConfig::new("127.0.0.1:0", "bastion:22", "db.internal:5432", credentials())
        .unwrap()
        .with_verify_remote(false)
}

async fn start(
    connector: &MemoryConnector,
    config: ForwarderConfig,
) -> TunnelForwarder<MemorySession> {
    TunnelForwarder::start(Arc::new(config), connector)
        .await
        .expect("forwarder should start")
}

/// Run until triggered through the shutdown signal
fn spawn(forwarder: TunnelForwarder<MemorySession>) -> JoinHandle<ShutdownCause> {
    tokio::spawn(forwarder.run_until(std::future::pending()))
}

async fn next_inbound(remote: &mut MemoryRemote) -> tokio::io::DuplexStream {
    tokio::time::timeout(WAIT, remote.accept())
        .await
        .expect("timed out waiting for a logical stream")
        .expect("tunnel gone")
        .io
}

async fn finish(task: JoinHandle<ShutdownCause>) -> ShutdownCause {
    tokio::time::timeout(WAIT, task)
        .await
        .expect("forwarder did not shut down")
        .expect("forwarder task panicked")
}

#[tokio::test]
async fn test_ping_pong_and_eof() {
    let (connector, mut remote) = MemoryConnector::new();
    let stats = connector.stats();
    let forwarder = start(&connector, config()).await;
    let addr = forwarder.local_addr();
    let signal = forwarder.shutdown_signal();
    let task = spawn(forwarder);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"PING").await.unwrap();

    let mut service = next_inbound(&mut remote).await;
    let mut buf = [0u8; 4];
    service.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");

    service.write_all(b"PONG").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PONG");

    // Client closes: the service observes EOF within bounded time.
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, service.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    drop(service);

    let mut tail = Vec::new();
    tokio::time::timeout(WAIT, client.read_to_end(&mut tail))
        .await
        .unwrap()
        .unwrap();
    assert!(tail.is_empty());

    signal.trigger(ShutdownCause::Interrupt);
    let cause = finish(task).await;
    assert!(matches!(cause, ShutdownCause::Interrupt));
    assert_eq!(stats.connects(), 1);
    assert_eq!(stats.closes(), 1);
}

#[tokio::test]
async fn test_large_payload_is_relayed_unmodified() {
    let (connector, mut remote) = MemoryConnector::new();
    let connector = connector.with_pipe_capacity(512);
    let forwarder = start(&connector, config()).await;
    let addr = forwarder.local_addr();
    let signal = forwarder.shutdown_signal();
    let task = spawn(forwarder);

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut service = next_inbound(&mut remote).await;

    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        client.write_all(&sent).await.unwrap();
        client.shutdown().await.unwrap();
        client
    });

    let mut received = Vec::new();
    tokio::time::timeout(WAIT, service.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, payload);

    drop(writer.await.unwrap());
    signal.trigger(ShutdownCause::Interrupt);
    finish(task).await;
}

#[tokio::test]
async fn test_single_tunnel_serves_every_client() {
    let (connector, mut remote) = MemoryConnector::new();
    let stats = connector.stats();
    let forwarder = start(&connector, config().with_verify_remote(true)).await;
    let addr = forwarder.local_addr();
    let signal = forwarder.shutdown_signal();
    let task = spawn(forwarder);

    // The startup probe is already closed.
    let mut probe = next_inbound(&mut remote).await;
    let mut buf = Vec::new();
    assert_eq!(probe.read_to_end(&mut buf).await.unwrap(), 0);

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[i]).await.unwrap();
        let mut service = next_inbound(&mut remote).await;
        let mut byte = [0u8; 1];
        service.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], i);
        clients.push((client, service));
    }

    assert_eq!(stats.connects(), 1);
    assert_eq!(stats.streams_opened(), 4);

    signal.trigger(ShutdownCause::Interrupt);
    finish(task).await;
    assert_eq!(stats.connects(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_tear_down_once() {
    let (connector, _remote) = MemoryConnector::new();
    let stats = connector.stats();
    let forwarder = start(&connector, config()).await;
    let signal = forwarder.shutdown_signal();
    let task = tokio::spawn(forwarder.run_until(async { ShutdownCause::Terminate }));

    let mut triggers = Vec::new();
    for _ in 0..32 {
        let signal = signal.clone();
        triggers.push(tokio::spawn(async move {
            signal.trigger(ShutdownCause::Interrupt)
        }));
    }
    let mut winners = 0;
    for trigger in triggers {
        if trigger.await.unwrap() {
            winners += 1;
        }
    }

    let cause = finish(task).await;
    assert!(winners <= 1);
    assert!(!cause.is_fatal());
    assert_eq!(stats.closes(), 1);
}

#[tokio::test]
async fn test_listener_closed_after_shutdown() {
    let (connector, _remote) = MemoryConnector::new();
    let stats = connector.stats();
    let forwarder = start(&connector, config()).await;
    let addr = forwarder.local_addr();
    let signal = forwarder.shutdown_signal();
    let task = spawn(forwarder);

    signal.trigger(ShutdownCause::Interrupt);
    finish(task).await;

    assert!(TcpStream::connect(addr).await.is_err());
    assert_eq!(stats.streams_opened(), 0);
}

#[tokio::test]
async fn test_rejected_credentials_fail_startup() {
    let (connector, _remote) = MemoryConnector::new();
    let connector = connector.rejecting_credentials();
    let stats = connector.stats();

    let result = TunnelForwarder::start(Arc::new(config()), &connector).await;
    match result {
        Err(ForwardError::Connect {
            transport, host, ..
        }) => {
            assert_eq!(transport, "memory");
            assert_eq!(host, "bastion:22");
        }
        Err(other) => panic!("expected connect error, got {}", other),
        Ok(_) => panic!("expected connect error"),
    }
    assert_eq!(stats.connects(), 0);
}

#[tokio::test]
async fn test_unreachable_remote_fails_startup() {
    let (connector, remote) = MemoryConnector::new();
    let stats = connector.stats();
    drop(remote);

    let result =
        TunnelForwarder::start(Arc::new(config().with_verify_remote(true)), &connector).await;
    assert!(matches!(result, Err(ForwardError::Dial { .. })));
    assert_eq!(stats.closes(), 1);
}

#[tokio::test]
async fn test_bind_conflict_fails_startup() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = occupied.local_addr().unwrap().to_string();

    let (connector, _remote) = MemoryConnector::new();
    let stats = connector.stats();
    let config = ForwarderConfig::new(address.clone(), "bastion:22", "db:5432", credentials())
        .unwrap()
        .with_verify_remote(false);

    let result = TunnelForwarder::start(Arc::new(config), &connector).await;
    match result {
        Err(ForwardError::Bind { address: failed, .. }) => assert_eq!(failed, address),
        Err(other) => panic!("expected bind error, got {}", other),
        Ok(_) => panic!("expected bind error"),
    }
    assert_eq!(stats.closes(), 1);
}

#[tokio::test]
async fn test_empty_remote_rejected_before_dial() {
    let (connector, _remote) = MemoryConnector::new();
    let stats = connector.stats();

    let result = ForwarderConfig::new("127.0.0.1:0", "bastion:22", "", credentials());
    assert!(matches!(result, Err(ConfigError::MissingRemote)));

    let error: ForwardError = result.unwrap_err().into();
    assert!(error.to_string().contains("Remote address is missing"));
    assert_eq!(stats.connects(), 0);
}

/// Client write after the service vanished: fails local -> remote
async fn break_pair(addr: std::net::SocketAddr, remote: &mut MemoryRemote) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    let service = next_inbound(remote).await;
    drop(service);

    let mut buf = Vec::new();
    tokio::time::timeout(WAIT, client.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    client.write_all(b"late").await.unwrap();
    client
}

#[tokio::test]
async fn test_pair_error_shuts_tunnel_down_by_default() {
    let (connector, mut remote) = MemoryConnector::new();
    let stats = connector.stats();
    let forwarder = start(&connector, config()).await;
    let addr = forwarder.local_addr();
    let task = spawn(forwarder);

    let _client = break_pair(addr, &mut remote).await;

    match finish(task).await {
        ShutdownCause::Fatal(error) => match error.as_ref() {
            ForwardError::Copy { direction, .. } => {
                assert_eq!(*direction, Direction::LocalToRemote)
            }
            other => panic!("expected copy error, got {}", other),
        },
        other => panic!("expected fatal shutdown, got {}", other),
    }
    assert_eq!(stats.closes(), 1);
}

#[tokio::test]
async fn test_isolated_pair_error_keeps_forwarding() {
    let (connector, mut remote) = MemoryConnector::new();
    let stats = connector.stats();
    let config = config().with_pair_error_policy(PairErrorPolicy::Isolate);
    let forwarder = start(&connector, config).await;
    let addr = forwarder.local_addr();
    let signal = forwarder.shutdown_signal();
    let task = spawn(forwarder);

    let _broken = break_pair(addr, &mut remote).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!signal.is_triggered());

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    let mut service = next_inbound(&mut remote).await;
    let mut buf = [0u8; 4];
    service.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");

    signal.trigger(ShutdownCause::Interrupt);
    assert!(matches!(finish(task).await, ShutdownCause::Interrupt));
    assert_eq!(stats.closes(), 1);
}

#[tokio::test]
async fn test_dial_failure_for_client_is_fatal_by_default() {
    let (connector, remote) = MemoryConnector::new();
    let forwarder = start(&connector, config()).await;
    let addr = forwarder.local_addr();
    let task = spawn(forwarder);
    drop(remote);

    let _client = TcpStream::connect(addr).await.unwrap();

    match finish(task).await {
        ShutdownCause::Fatal(error) => {
            assert!(matches!(error.as_ref(), ForwardError::Dial { .. }))
        }
        other => panic!("expected fatal shutdown, got {}", other),
    }
}

#[tokio::test]
async fn test_isolated_dial_failure_drops_only_the_client() {
    let (connector, remote) = MemoryConnector::new();
    let config = config().with_pair_error_policy(PairErrorPolicy::Isolate);
    let forwarder = start(&connector, config).await;
    let addr = forwarder.local_addr();
    let signal = forwarder.shutdown_signal();
    let task = spawn(forwarder);
    drop(remote);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(WAIT, client.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert!(!signal.is_triggered());

    signal.trigger(ShutdownCause::Terminate);
    assert!(matches!(finish(task).await, ShutdownCause::Terminate));
}
