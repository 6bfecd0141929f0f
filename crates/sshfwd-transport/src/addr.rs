//! Remote endpoint addresses

use crate::TransportError;
use std::fmt;
use std::str::FromStr;

/// A `host:port` endpoint resolved on the far side of the tunnel
///
/// The host is kept as written: name resolution happens on the intermediary,
/// which is the only machine guaranteed to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for TargetAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| TransportError::InvalidAddress {
            address: s.to_string(),
            reason,
        };

        let s_trimmed = s.trim();
        if s_trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        let (host, port) = s_trimmed
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;

        // [::1]:80
        let (host, bracketed) = match host.strip_prefix('[') {
            Some(inner) => (
                inner
                    .strip_suffix(']')
                    .ok_or_else(|| invalid("unbalanced brackets"))?,
                true,
            ),
            None => (host, false),
        };

        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        if host.contains(['[', ']']) {
            return Err(invalid("unbalanced brackets"));
        }
        if host.contains(':') && !bracketed {
            return Err(invalid("IPv6 hosts must be written as [addr]:port"));
        }

        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
