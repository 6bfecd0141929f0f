//! Bidirectional relay between a client connection and a tunnel stream

use crate::config::PairErrorPolicy;
use crate::error::ForwardError;
use crate::shutdown::{ShutdownCause, ShutdownSignal};
use sshfwd_transport::TunnelIo;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Copy direction within a forwarding pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client connection → tunnel stream
    LocalToRemote,
    /// Tunnel stream → client connection
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToRemote => write!(f, "local -> remote"),
            Direction::RemoteToLocal => write!(f, "remote -> local"),
        }
    }
}

/// Outcome of a pair that ended without error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairSummary {
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
    /// The second direction was cut off after staying idle for the linger
    /// period
    pub lingered: bool,
}

/// Relays one forwarding pair and reports its failure
pub struct StreamForwarder {
    peer: SocketAddr,
    linger: Duration,
    policy: PairErrorPolicy,
    shutdown: ShutdownSignal,
}

impl StreamForwarder {
    pub fn new(
        peer: SocketAddr,
        linger: Duration,
        policy: PairErrorPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            peer,
            linger,
            policy,
            shutdown,
        }
    }

    /// Forward until the pair ends, then report a failure to the shutdown latch
    ///
    /// Returns early, closing both halves, once shutdown has been triggered.
    pub async fn run<S: TunnelIo>(self, client: TcpStream, stream: S) {
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!(peer = %self.peer, "Closing forwarding pair on shutdown");
                return;
            }
            outcome = self.forward(client, stream) => outcome,
        };

        match outcome {
            Ok(summary) => {
                debug!(
                    peer = %self.peer,
                    bytes_to_remote = summary.bytes_to_remote,
                    bytes_to_local = summary.bytes_to_local,
                    lingered = summary.lingered,
                    "Forwarding pair closed"
                );
            }
            Err(e) => self.report(e),
        }
    }

    /// Copy both directions; both halves are dropped (closed) on return
    pub async fn forward<S: TunnelIo>(
        &self,
        client: TcpStream,
        stream: S,
    ) -> Result<PairSummary, ForwardError> {
        let (client_read, client_write) = client.into_split();
        let (stream_read, stream_write) = tokio::io::split(stream);

        let relayed = Relayed::default();
        let upstream = copy_half(client_read, stream_write, &relayed.to_remote);
        let downstream = copy_half(stream_read, client_write, &relayed.to_local);
        tokio::pin!(upstream, downstream);

        let (first, result) = tokio::select! {
            result = &mut upstream => (Direction::LocalToRemote, result),
            result = &mut downstream => (Direction::RemoteToLocal, result),
        };
        self.finished(first, result, &relayed)?;

        let lingered = match first {
            Direction::LocalToRemote => {
                self.linger(Direction::RemoteToLocal, &mut downstream, &relayed).await?
            }
            Direction::RemoteToLocal => {
                self.linger(Direction::LocalToRemote, &mut upstream, &relayed).await?
            }
        };

        Ok(PairSummary {
            bytes_to_remote: relayed.load(Direction::LocalToRemote),
            bytes_to_local: relayed.load(Direction::RemoteToLocal),
            lingered,
        })
    }

    /// Let the remaining direction run until it ends or stays idle for the
    /// linger period; returns `true` when it was cut off
    async fn linger<F>(
        &self,
        direction: Direction,
        mut remaining: F,
        relayed: &Relayed,
    ) -> Result<bool, ForwardError>
    where
        F: Future<Output = io::Result<()>> + Unpin,
    {
        loop {
            let before = relayed.load(direction);
            match tokio::time::timeout(self.linger, &mut remaining).await {
                Ok(result) => return self.finished(direction, result, relayed).map(|()| false),
                Err(_) if relayed.load(direction) != before => continue,
                Err(_) => {
                    self.sent(direction, relayed.load(direction));
                    info!(
                        peer = %self.peer,
                        direction = %direction,
                        "Half-closed pair idle for {:?}, closing",
                        self.linger
                    );
                    return Ok(true);
                }
            }
        }
    }

    fn finished(
        &self,
        direction: Direction,
        result: io::Result<()>,
        relayed: &Relayed,
    ) -> Result<(), ForwardError> {
        match result {
            Ok(()) => {
                self.sent(direction, relayed.load(direction));
                Ok(())
            }
            Err(source) => {
                warn!(peer = %self.peer, direction = %direction, "Copy failed: {}", source);
                Err(ForwardError::Copy {
                    direction,
                    peer: self.peer,
                    source,
                })
            }
        }
    }

    fn sent(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::LocalToRemote => {
                info!(peer = %self.peer, bytes, "Data sent to remote host")
            }
            Direction::RemoteToLocal => {
                info!(peer = %self.peer, bytes, "Data sent to local host")
            }
        }
    }

    fn report(&self, error: ForwardError) {
        match self.policy {
            PairErrorPolicy::Shutdown => {
                error!(peer = %self.peer, "{}", error);
                self.shutdown.trigger(ShutdownCause::fatal(error));
            }
            PairErrorPolicy::Isolate => {
                warn!(peer = %self.peer, "Forwarding pair failed, closing it: {}", error);
            }
        }
    }
}

/// Bytes relayed per direction, readable while a copy is in flight
#[derive(Default)]
struct Relayed {
    to_remote: AtomicU64,
    to_local: AtomicU64,
}

impl Relayed {
    fn load(&self, direction: Direction) -> u64 {
        match direction {
            Direction::LocalToRemote => self.to_remote.load(Ordering::Relaxed),
            Direction::RemoteToLocal => self.to_local.load(Ordering::Relaxed),
        }
    }
}

/// Copy until EOF, then pass the half-close on to the destination
async fn copy_half<R, W>(mut reader: R, mut writer: W, relayed: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        relayed.fetch_add(n as u64, Ordering::Relaxed);
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Failed to propagate half-close: {}", e);
    }
    Ok(())
}
