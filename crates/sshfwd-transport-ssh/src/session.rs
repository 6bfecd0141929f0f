//! Authenticated SSH session carrying direct-tcpip channels

use crate::connector::HostKeyObserver;
use async_trait::async_trait;
use russh::client::Handle;
use russh::Disconnect;
use sshfwd_transport::{
    BoxedStream, TargetAddr, TransportError, TransportResult, TunnelSession,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// One SSH connection; every logical stream is a `direct-tcpip` channel on it
pub struct SshSession {
    id: String,
    host: String,
    handle: Handle<HostKeyObserver>,
    closed: AtomicBool,
    channels_opened: AtomicU64,
}

impl SshSession {
    pub(crate) fn new(host: String, handle: Handle<HostKeyObserver>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            host,
            handle,
            closed: AtomicBool::new(false),
            channels_opened: AtomicU64::new(0),
        }
    }

    /// Number of channels opened over this session so far
    pub fn channels_opened(&self) -> u64 {
        self.channels_opened.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("closed", &self.is_closed())
            .field("channels_opened", &self.channels_opened())
            .finish()
    }
}

#[async_trait]
impl TunnelSession for SshSession {
    type Stream = BoxedStream;

    async fn open_stream(
        &self,
        target: &TargetAddr,
        originator: Option<SocketAddr>,
    ) -> TransportResult<Self::Stream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let (originator_host, originator_port) = match originator {
            Some(addr) => (addr.ip().to_string(), u32::from(addr.port())),
            None => ("0.0.0.0".to_string(), 0),
        };

        let channel = self
            .handle
            .channel_open_direct_tcpip(
                target.host(),
                u32::from(target.port()),
                originator_host,
                originator_port,
            )
            .await
            .map_err(|e| TransportError::StreamOpenFailed {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        let opened = self.channels_opened.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            session = %self.id,
            channel = ?channel.id(),
            target = %target,
            opened,
            "Opened direct-tcpip channel"
        );

        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, reason, "en")
            .await
        {
            debug!("SSH disconnect from {} failed: {}", self.host, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn session_id(&self) -> String {
        self.id.clone()
    }
}
