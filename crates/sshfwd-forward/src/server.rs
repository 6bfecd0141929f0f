//! Local listener and tunnel lifecycle

use crate::config::{ForwarderConfig, PairErrorPolicy};
use crate::error::ForwardError;
use crate::forwarder::StreamForwarder;
use crate::shutdown::{ShutdownCause, ShutdownCoordinator, ShutdownSignal};
use sshfwd_transport::{TunnelConnector, TunnelSession};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Accepts local clients and pairs each with a fresh logical stream
pub(crate) struct AcceptLoop<S> {
    config: Arc<ForwarderConfig>,
    session: Arc<S>,
    shutdown: ShutdownSignal,
}

impl<S> AcceptLoop<S>
where
    S: TunnelSession + 'static,
{
    pub(crate) fn new(
        config: Arc<ForwarderConfig>,
        session: Arc<S>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            session,
            shutdown,
        }
    }

    /// Accept until shutdown is latched; the listener is dropped on return
    pub(crate) async fn run(self, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Accept loop stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        self.spawn_pair(socket, peer);
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        self.shutdown.trigger(ShutdownCause::fatal(ForwardError::Accept(e)));
                        break;
                    }
                },
            }
        }
    }

    fn spawn_pair(&self, socket: TcpStream, peer: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
        }

        let config = self.config.clone();
        let session = self.session.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let opened = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                opened = session.open_stream(&config.remote, Some(peer)) => opened,
            };

            let stream = match opened {
                Ok(stream) => stream,
                Err(source) => {
                    let error = ForwardError::Dial {
                        target: config.remote.to_string(),
                        source,
                    };
                    report_dial_failure(
                        config.pair_error_policy,
                        session.as_ref(),
                        &shutdown,
                        peer,
                        error,
                    );
                    return;
                }
            };

            debug!(peer = %peer, target = %config.remote, "Logical stream opened");
            StreamForwarder::new(peer, config.linger, config.pair_error_policy, shutdown)
                .run(socket, stream)
                .await;
        });
    }
}

fn report_dial_failure<S: TunnelSession>(
    policy: PairErrorPolicy,
    session: &S,
    shutdown: &ShutdownSignal,
    peer: SocketAddr,
    error: ForwardError,
) {
    match policy {
        PairErrorPolicy::Isolate if !session.is_closed() => {
            warn!(peer = %peer, "Dropping connection: {}", error);
        }
        _ => {
            error!(peer = %peer, "{}", error);
            shutdown.trigger(ShutdownCause::fatal(error));
        }
    }
}

/// A started forwarder: tunnel established, local address bound
///
/// ```text
/// start():     connect ─► probe remote ─► bind
/// run_until(): accept loop ─┐
///              signal ──────┼─► ShutdownCoordinator ─► close tunnel
///              pair error ──┘
/// ```
pub struct TunnelForwarder<S: TunnelSession> {
    config: Arc<ForwarderConfig>,
    session: Arc<S>,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: ShutdownSignal,
}

impl<S> TunnelForwarder<S>
where
    S: TunnelSession + 'static,
{
    /// Establish the tunnel and bind the local address
    ///
    /// Every failure here is a startup error; a tunnel that was already
    /// established is closed before returning it.
    pub async fn start<C>(
        config: Arc<ForwarderConfig>,
        connector: &C,
    ) -> Result<Self, ForwardError>
    where
        C: TunnelConnector<Session = S>,
    {
        info!(
            "Listening: {}; SSH Host: {}; Forwarding: {}",
            config.local_addr, config.ssh_host, config.remote
        );

        let session = connector
            .connect(&config.ssh_host, &config.credentials)
            .await
            .map_err(|source| ForwardError::Connect {
                transport: connector.name().to_string(),
                host: config.ssh_host.clone(),
                source,
            })?;
        info!(
            session = %session.session_id(),
            user = %config.credentials.user,
            method = config.credentials.method.name(),
            "SSH established at {}",
            config.ssh_host
        );

        if config.verify_remote {
            match session.open_stream(&config.remote, None).await {
                Ok(probe) => {
                    drop(probe);
                    info!("SSH tunnel established at {}", config.remote);
                }
                Err(source) => {
                    session.close("remote endpoint unreachable").await;
                    return Err(ForwardError::Dial {
                        target: config.remote.to_string(),
                        source,
                    });
                }
            }
        }

        let listener = match TcpListener::bind(config.local_addr.as_str()).await {
            Ok(listener) => listener,
            Err(e) => {
                session.close("local bind failed").await;
                return Err(ForwardError::Bind {
                    address: config.local_addr.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let local_addr = listener.local_addr()?;
        info!("Accepting connections on {}", local_addr);

        Ok(Self {
            config,
            session: Arc::new(session),
            listener,
            local_addr,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// The bound local address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for triggering or observing shutdown from outside
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Forward until `external` fires or a fatal error is reported
    pub async fn run_until<F>(self, external: F) -> ShutdownCause
    where
        F: Future<Output = ShutdownCause>,
    {
        let accept_loop =
            AcceptLoop::new(self.config, self.session.clone(), self.shutdown.clone());
        let accept_task = tokio::spawn(accept_loop.run(self.listener));

        ShutdownCoordinator::new(self.shutdown)
            .run(external, accept_task, self.session)
            .await
    }
}

/// Start the forwarder and run it until shutdown
pub async fn run<C, F>(
    config: Arc<ForwarderConfig>,
    connector: &C,
    external: F,
) -> Result<ShutdownCause, ForwardError>
where
    C: TunnelConnector,
    C::Session: 'static,
    F: Future<Output = ShutdownCause>,
{
    let forwarder = TunnelForwarder::start(config, connector).await?;
    Ok(forwarder.run_until(external).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshfwd_transport::memory::MemoryConnector;
    use sshfwd_transport::{AuthMethod, Credentials};
    use std::time::Duration;

    fn config() -> Arc<ForwarderConfig> {
        let credentials = Credentials::new("deploy", AuthMethod::Password("pw".to_string()));
        Arc::new(
            ForwarderConfig::new("127.0.0.1:0", "bastion:22", "db.internal:5432", credentials)
                .unwrap()
                .with_verify_remote(false),
        )
    }

    #[tokio::test]
    async fn test_latched_loop_ignores_queued_connections() {
        let (connector, _remote) = MemoryConnector::new();
        let stats = connector.stats();
        let session = Arc::new(
            connector
                .connect("bastion:22", &config().credentials)
                .await
                .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _queued = TcpStream::connect(addr).await.unwrap();

        let shutdown = ShutdownSignal::new();
        shutdown.trigger(ShutdownCause::Interrupt);

        let accept_loop = AcceptLoop::new(config(), session, shutdown);
        tokio::time::timeout(Duration::from_secs(1), accept_loop.run(listener))
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert_eq!(stats.streams_opened(), 0);
    }

    #[tokio::test]
    async fn test_stream_targets_remote_with_originator() {
        let (connector, mut remote) = MemoryConnector::new();
        let session = Arc::new(
            connector
                .connect("bastion:22", &config().credentials)
                .await
                .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(AcceptLoop::new(config(), session, shutdown.clone()).run(listener));

        let client = TcpStream::connect(addr).await.unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(1), remote.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.target.to_string(), "db.internal:5432");
        assert_eq!(inbound.originator, Some(client.local_addr().unwrap()));

        shutdown.trigger(ShutdownCause::Interrupt);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
