//! In-process loopback transport
//!
//! Logical streams are `tokio::io::duplex` pipes: the session keeps one end
//! and hands the other to a [`MemoryRemote`], which plays the part of the
//! remote endpoint. Used as the stub tunnel in the engine's tests.

use crate::{
    Credentials, TargetAddr, TransportError, TransportResult, TunnelConnector, TunnelSession,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Counters shared by a connector and every session it creates
#[derive(Debug, Default)]
pub struct MemoryStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    streams_opened: AtomicUsize,
}

impl MemoryStats {
    /// Number of sessions established
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of `close` calls across all sessions
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of logical streams successfully opened
    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }
}

/// A logical stream as seen from the remote endpoint
#[derive(Debug)]
pub struct InboundStream {
    pub target: TargetAddr,
    pub originator: Option<SocketAddr>,
    pub io: DuplexStream,
}

/// Receiving side of the loopback: yields every stream opened over the tunnel
///
/// Dropping it makes the remote endpoint unreachable, so later `open_stream`
/// calls fail.
#[derive(Debug)]
pub struct MemoryRemote {
    inbound: mpsc::UnboundedReceiver<InboundStream>,
}

impl MemoryRemote {
    /// Wait for the next stream; `None` once every session is gone
    pub async fn accept(&mut self) -> Option<InboundStream> {
        self.inbound.recv().await
    }
}

/// Connector producing loopback sessions
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    inbound: mpsc::UnboundedSender<InboundStream>,
    stats: Arc<MemoryStats>,
    reject_auth: bool,
    pipe_capacity: usize,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryRemote) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            inbound: tx,
            stats: Arc::new(MemoryStats::default()),
            reject_auth: false,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        };
        (connector, MemoryRemote { inbound: rx })
    }

    /// Make every connection attempt fail authentication
    pub fn rejecting_credentials(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    pub fn stats(&self) -> Arc<MemoryStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl TunnelConnector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> TransportResult<Self::Session> {
        if self.reject_auth {
            return Err(TransportError::AuthenticationFailed(format!(
                "{} rejected by {}",
                credentials.method.name(),
                host
            )));
        }

        let id = self.stats.connects.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Loopback session {} established to {}", id, host);

        Ok(MemorySession {
            id,
            host: host.to_string(),
            inbound: self.inbound.clone(),
            closed: AtomicBool::new(false),
            stats: self.stats.clone(),
            pipe_capacity: self.pipe_capacity,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Loopback session
#[derive(Debug)]
pub struct MemorySession {
    id: usize,
    host: String,
    inbound: mpsc::UnboundedSender<InboundStream>,
    closed: AtomicBool,
    stats: Arc<MemoryStats>,
    pipe_capacity: usize,
}

#[async_trait]
impl TunnelSession for MemorySession {
    type Stream = DuplexStream;

    async fn open_stream(
        &self,
        target: &TargetAddr,
        originator: Option<SocketAddr>,
    ) -> TransportResult<Self::Stream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let (near, far) = tokio::io::duplex(self.pipe_capacity);
        self.inbound
            .send(InboundStream {
                target: target.clone(),
                originator,
                io: far,
            })
            .map_err(|_| TransportError::StreamOpenFailed {
                target: target.to_string(),
                reason: "remote endpoint unreachable".to_string(),
            })?;

        self.stats.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(near)
    }

    async fn close(&self, reason: &str) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        debug!("Loopback session {} closed: {}", self.id, reason);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn session_id(&self) -> String {
        format!("memory-{}", self.id)
    }
}
