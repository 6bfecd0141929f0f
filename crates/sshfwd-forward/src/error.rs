//! Forwarding engine errors

use crate::config::ConfigError;
use crate::forwarder::Direction;
use sshfwd_transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while starting or running the forwarder
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to establish {transport} tunnel to {host}: {source}")]
    Connect {
        transport: String,
        host: String,
        source: TransportError,
    },

    #[error("Failed to reach {target} through the tunnel: {source}")]
    Dial {
        target: String,
        source: TransportError,
    },

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this address\n  • Try using a different address or port")]
    Bind { address: String, reason: String },

    #[error("Failed to accept connection: {0}")]
    Accept(std::io::Error),

    #[error("Forwarding failed ({direction}) for {peer}: {source}")]
    Copy {
        direction: Direction,
        peer: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
