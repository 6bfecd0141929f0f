//! Transport abstraction layer for the forwarding tunnel
//!
//! This crate provides the traits the forwarding engine is written against, so
//! the engine never depends on a concrete secure transport. A transport hands
//! out exactly two capabilities: establishing one long-lived, multiplexed
//! session to an intermediary host, and opening logical byte streams to a
//! remote endpoint over that session.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Forwarding engine                       │
//! │        (accept loop, stream forwarder, shutdown)         │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            sshfwd-transport (this crate)                 │
//! │  - TunnelConnector      - TunnelSession                  │
//! │  - TunnelIo             - Credentials / TargetAddr       │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌────────────────────────────┬────────────────────────────┐
//! │ sshfwd-transport-ssh       │ memory (in-process stub,   │
//! │ (russh direct-tcpip)       │ used by tests)             │
//! └────────────────────────────┴────────────────────────────┘
//! ```

pub mod addr;
pub mod credentials;
pub mod memory;

pub use addr::TargetAddr;
pub use credentials::{AuthMethod, Credentials};

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid private key {path}: {reason}")]
    InvalidKey { path: String, reason: String },

    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        address: String,
        reason: &'static str,
    },

    #[error("Failed to open stream to {target}: {reason}")]
    StreamOpenFailed { target: String, reason: String },

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream carried inside a tunnel session
///
/// Anything that reads and writes asynchronously qualifies; the engine only
/// ever copies raw bytes through it.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased logical stream, for transports whose channel type is not nameable
pub type BoxedStream = Box<dyn TunnelIo>;

/// An established, multiplexed session to the intermediary host
///
/// One session carries every logical stream of a run. Opening a stream only
/// needs `&self`, so a session is shared behind an `Arc` without locking.
#[async_trait]
pub trait TunnelSession: Send + Sync + Debug {
    /// The logical stream type opened by this session
    type Stream: TunnelIo + 'static;

    /// Open a logical stream to `target`, reachable from the intermediary host
    ///
    /// `originator` is the address of the local peer the stream is opened for,
    /// when there is one.
    async fn open_stream(
        &self,
        target: &TargetAddr,
        originator: Option<SocketAddr>,
    ) -> TransportResult<Self::Stream>;

    /// Close the session. Streams still open over it become unusable.
    async fn close(&self, reason: &str);

    /// Check if the session is closed
    fn is_closed(&self) -> bool;

    /// The intermediary host this session is connected to
    fn host(&self) -> &str;

    /// A stable identifier for logging
    fn session_id(&self) -> String;
}

/// Client side: establishes the tunnel session
///
/// Exactly one authentication method (carried by [`Credentials`]) is tried
/// for the single connection attempt; any failure is returned to the caller.
#[async_trait]
pub trait TunnelConnector: Send + Sync + Debug {
    /// The session type created by this connector
    type Session: TunnelSession;

    /// Connect and authenticate to `host` (`address:port`)
    async fn connect(&self, host: &str, credentials: &Credentials)
        -> TransportResult<Self::Session>;

    /// Human-readable transport name (e.g. "SSH")
    fn name(&self) -> &str;
}
