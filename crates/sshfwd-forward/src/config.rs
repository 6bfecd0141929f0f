//! Forwarder configuration
//!
//! Built once at startup and shared read-only (behind an `Arc`) by the
//! connector, the accept loop and every forwarding pair.

use sshfwd_transport::{Credentials, TargetAddr, TransportError};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors, all detected before any network activity
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Remote address is missing")]
    MissingRemote,

    #[error("Local address is missing")]
    MissingLocal,

    #[error("SSH host address is missing")]
    MissingHost,

    #[error("Linger period must be greater than zero")]
    InvalidLinger,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What a failed forwarding pair does to the rest of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairErrorPolicy {
    /// Any pair error shuts the whole tunnel down
    #[default]
    Shutdown,

    /// Pair errors close only that pair; a dial failure is escalated only
    /// when the tunnel session itself is gone
    Isolate,
}

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Address the accept loop listens on (host:port)
    pub local_addr: String,

    /// SSH intermediary (host:port)
    pub ssh_host: String,

    /// Endpoint every logical stream targets, resolved by the intermediary
    pub remote: TargetAddr,

    pub credentials: Credentials,

    pub pair_error_policy: PairErrorPolicy,

    /// Open (and drop) one logical stream before listening, so an unreachable
    /// remote fails startup instead of the first client
    pub verify_remote: bool,

    /// How long a pair waits for its second direction once the first one
    /// has finished cleanly
    pub linger: Duration,
}

impl ForwarderConfig {
    pub const DEFAULT_LOCAL_ADDR: &'static str = "127.0.0.1:10080";
    pub const DEFAULT_SSH_HOST: &'static str = "127.0.0.1:22";
    pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

    /// Create a configuration, validating every address
    pub fn new(
        local_addr: impl Into<String>,
        ssh_host: impl Into<String>,
        remote: &str,
        credentials: Credentials,
    ) -> Result<Self, ConfigError> {
        if remote.trim().is_empty() {
            return Err(ConfigError::MissingRemote);
        }
        let remote: TargetAddr = remote.parse()?;

        let local_addr = local_addr.into();
        if local_addr.trim().is_empty() {
            return Err(ConfigError::MissingLocal);
        }

        let ssh_host = ssh_host.into();
        if ssh_host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }

        Ok(Self {
            local_addr,
            ssh_host,
            remote,
            credentials,
            pair_error_policy: PairErrorPolicy::default(),
            verify_remote: true,
            linger: Self::DEFAULT_LINGER,
        })
    }

    pub fn with_pair_error_policy(mut self, policy: PairErrorPolicy) -> Self {
        self.pair_error_policy = policy;
        self
    }

    pub fn with_verify_remote(mut self, verify: bool) -> Self {
        self.verify_remote = verify;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Result<Self, ConfigError> {
        if linger.is_zero() {
            return Err(ConfigError::InvalidLinger);
        }
        self.linger = linger;
        Ok(self)
    }
}
