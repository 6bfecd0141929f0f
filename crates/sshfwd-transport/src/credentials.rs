//! Authentication material for the tunnel session

use crate::{TransportError, TransportResult};
use std::fmt;
use std::path::PathBuf;

/// The single authentication method used for the connection attempt
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Private key file, optionally protected by a passphrase
    PublicKey {
        key_path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::Password(_) => "password",
        }
    }
}

// Secrets never reach the logs.
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PublicKey {
                key_path,
                passphrase,
            } => f
                .debug_struct("PublicKey")
                .field("key_path", key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            AuthMethod::Password(_) => f.debug_tuple("Password").field(&"<redacted>").finish(),
        }
    }
}

/// User identity plus the chosen authentication method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub method: AuthMethod,
}

impl Credentials {
    pub fn new(user: impl Into<String>, method: AuthMethod) -> Self {
        Self {
            user: user.into(),
            method,
        }
    }

    /// Pick the authentication method from the optional key and password
    ///
    /// Precedence is fixed: when both are configured the private key wins and
    /// the password is ignored. Empty strings count as "not configured".
    pub fn select(
        user: &str,
        key_path: Option<PathBuf>,
        passphrase: Option<String>,
        password: Option<String>,
    ) -> TransportResult<Self> {
        if user.trim().is_empty() {
            return Err(TransportError::ConfigurationError(
                "SSH user is missing".to_string(),
            ));
        }

        let key_path = key_path.filter(|p| !p.as_os_str().is_empty());
        let password = password.filter(|p| !p.is_empty());

        let method = match (key_path, password) {
            (Some(key_path), _) => AuthMethod::PublicKey {
                key_path,
                passphrase: passphrase.filter(|p| !p.is_empty()),
            },
            (None, Some(password)) => AuthMethod::Password(password),
            (None, None) => {
                return Err(TransportError::ConfigurationError(
                    "no authentication method configured: provide a private key or a password"
                        .to_string(),
                ))
            }
        };

        Ok(Self::new(user, method))
    }
}
