//! SSH connector: TCP connect, key exchange and user authentication

use crate::config::SshConfig;
use crate::session::SshSession;
use async_trait::async_trait;
use russh_keys::key::{KeyPair, PublicKey};
use sshfwd_transport::{
    AuthMethod, Credentials, TransportError, TransportResult, TunnelConnector,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Client handler for the SSH session
///
/// Every host key is accepted; its fingerprint is logged so operators can
/// compare it out of band.
pub(crate) struct HostKeyObserver {
    host: String,
}

#[async_trait]
impl russh::client::Handler for HostKeyObserver {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "SSH host key presented"
        );
        Ok(true)
    }
}

/// Secret material prepared before the network dial
enum Secret {
    Key(Arc<KeyPair>),
    Password(String),
}

/// Load a private key from disk, decrypting it with `passphrase` if given
pub fn load_identity(path: &Path, passphrase: Option<&str>) -> TransportResult<KeyPair> {
    russh_keys::load_secret_key(path, passphrase).map_err(|e| TransportError::InvalidKey {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn prepare_secret(method: &AuthMethod) -> TransportResult<Secret> {
    match method {
        AuthMethod::PublicKey {
            key_path,
            passphrase,
        } => {
            let key = load_identity(key_path, passphrase.as_deref())?;
            debug!("Loaded private key from {}", key_path.display());
            Ok(Secret::Key(Arc::new(key)))
        }
        AuthMethod::Password(password) => Ok(Secret::Password(password.clone())),
    }
}

/// SSH connector
///
/// Produces one authenticated [`SshSession`] per `connect` call.
#[derive(Debug)]
pub struct SshConnector {
    config: Arc<SshConfig>,
}

impl SshConnector {
    pub fn new(config: Arc<SshConfig>) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl TunnelConnector for SshConnector {
    type Session = SshSession;

    async fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> TransportResult<Self::Session> {
        // Unreadable keys fail before anything touches the network.
        let secret = prepare_secret(&credentials.method)?;

        let russh_config = Arc::new(self.config.build_client_config());
        let handler = HostKeyObserver {
            host: host.to_string(),
        };

        debug!("Connecting to SSH host {}", host);
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            russh::client::connect(russh_config, host, handler),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| {
            TransportError::ConnectionError(format!("Failed to connect to {}: {}", host, e))
        })?;

        let method = credentials.method.name();
        let accepted = match secret {
            Secret::Key(key) => {
                handle
                    .authenticate_publickey(credentials.user.as_str(), key)
                    .await
            }
            Secret::Password(password) => {
                handle
                    .authenticate_password(credentials.user.as_str(), password)
                    .await
            }
        }
        .map_err(|e| {
            TransportError::AuthenticationFailed(format!("{} authentication error: {}", method, e))
        })?;

        if !accepted {
            return Err(TransportError::AuthenticationFailed(format!(
                "{} authentication rejected for user '{}' at {}",
                method, credentials.user, host
            )));
        }

        info!(
            host = %host,
            user = %credentials.user,
            method = method,
            "SSH session authenticated"
        );

        Ok(SshSession::new(host.to_string(), handle))
    }

    fn name(&self) -> &str {
        "SSH"
    }
}
