//! SSH transport configuration

use sshfwd_transport::{TransportError, TransportResult};
use std::time::Duration;

/// SSH client tuning
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Upper bound for TCP connect plus key exchange
    pub connect_timeout: Duration,

    /// Interval between keep-alive requests; `None` disables them
    pub keepalive_interval: Option<Duration>,

    /// Unanswered keep-alives tolerated before the session is dropped
    pub keepalive_max: usize,

    /// Close the session after this long without traffic; `None` never does
    pub inactivity_timeout: Option<Duration>,
}

impl SshConfig {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            inactivity_timeout: None,
        }
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the keep-alive interval (zero disables keep-alives)
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = if interval.is_zero() {
            None
        } else {
            Some(interval)
        };
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "connect timeout must be greater than zero".to_string(),
            ));
        }
        if self.keepalive_interval.is_some() && self.keepalive_max == 0 {
            return Err(TransportError::ConfigurationError(
                "keepalive_max must be at least 1 when keep-alives are enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the russh client configuration
    pub(crate) fn build_client_config(&self) -> russh::client::Config {
        russh::client::Config {
            inactivity_timeout: self.inactivity_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self::client_default()
    }
}
