//! Shutdown latch and coordinator
//!
//! Every fatal condition (OS signal, accept failure, forwarding failure)
//! converges on one [`ShutdownSignal`]. The first trigger is kept and wakes
//! every waiter; later triggers are dropped without blocking the caller.
//! [`ShutdownCoordinator`] is the single consumer: it waits for that first
//! trigger and then tears the listener and the tunnel down exactly once.

use crate::error::ForwardError;
use sshfwd_transport::TunnelSession;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why the tunnel is shutting down
#[derive(Debug, Clone)]
pub enum ShutdownCause {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    Fatal(Arc<ForwardError>),
}

impl ShutdownCause {
    pub fn fatal(error: ForwardError) -> Self {
        ShutdownCause::Fatal(Arc::new(error))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownCause::Fatal(_))
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Interrupt => write!(f, "interrupt signal received"),
            ShutdownCause::Terminate => write!(f, "termination signal received"),
            ShutdownCause::Fatal(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug, Default)]
struct Latch {
    cause: OnceLock<ShutdownCause>,
    token: CancellationToken,
}

/// One-shot, many-producer shutdown latch
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Latch>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `cause` if nothing was latched before
    ///
    /// Returns `true` for the trigger that won. Never blocks.
    pub fn trigger(&self, cause: ShutdownCause) -> bool {
        match self.inner.cause.set(cause) {
            Ok(()) => {
                self.inner.token.cancel();
                true
            }
            Err(late) => {
                debug!("Discarding late shutdown trigger: {}", late);
                false
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.cause.get().is_some()
    }

    /// The latched cause, if any
    pub fn cause(&self) -> Option<ShutdownCause> {
        self.inner.cause.get().cloned()
    }

    /// Resolves once a cause has been latched
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Wait for the latched cause
    pub async fn wait(&self) -> ShutdownCause {
        self.cancelled().await;
        self.cause()
            .expect("shutdown token is only cancelled after a cause is latched")
    }
}

/// Single consumer of the shutdown latch
pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
}

impl ShutdownCoordinator {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }

    /// Wait for the first trigger, whether `external` or a reported failure
    ///
    /// If `external` fires but loses the race to a concurrent failure, the
    /// failure is the cause returned.
    pub async fn wait_for_trigger<F>(&self, external: F) -> ShutdownCause
    where
        F: Future<Output = ShutdownCause>,
    {
        tokio::select! {
            biased;
            cause = self.signal.wait() => cause,
            cause = external => {
                self.signal.trigger(cause);
                self.signal.wait().await
            }
        }
    }

    /// Wait for the first trigger, then stop accepting and close the tunnel
    ///
    /// Consumes the coordinator, so teardown runs once per process.
    pub async fn run<S, F>(
        self,
        external: F,
        accept_loop: JoinHandle<()>,
        session: Arc<S>,
    ) -> ShutdownCause
    where
        S: TunnelSession,
        F: Future<Output = ShutdownCause>,
    {
        let cause = self.wait_for_trigger(external).await;
        if cause.is_fatal() {
            error!("Shutting down tunnel: {}", cause);
        } else {
            info!("Shutting down tunnel: {}", cause);
        }

        // The accept loop observes the latch and drops the listener.
        if let Err(e) = accept_loop.await {
            warn!("Accept loop task ended abnormally: {}", e);
        }

        session.close(&cause.to_string()).await;
        info!("Tunnel to {} closed", session.host());

        cause
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix
pub async fn os_signal() -> ShutdownCause {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = interrupt() => ShutdownCause::Interrupt,
                    _ = terminate.recv() => ShutdownCause::Terminate,
                }
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                interrupt().await;
                ShutdownCause::Interrupt
            }
        }
    }

    #[cfg(not(unix))]
    {
        interrupt().await;
        ShutdownCause::Interrupt
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error listening for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    fn accept_failure() -> ShutdownCause {
        ShutdownCause::fatal(ForwardError::Accept(io::Error::new(
            io::ErrorKind::Other,
            "too many open files",
        )))
    }

    #[test]
    fn test_first_trigger_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.cause().is_none());

        assert!(signal.trigger(ShutdownCause::Interrupt));
        assert!(!signal.trigger(accept_failure()));
        assert!(!signal.trigger(ShutdownCause::Terminate));

        assert!(signal.is_triggered());
        assert!(matches!(signal.cause(), Some(ShutdownCause::Interrupt)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_latch_once() {
        let signal = ShutdownSignal::new();

        let mut tasks = Vec::new();
        for i in 0..64 {
            let signal = signal.clone();
            tasks.push(tokio::spawn(async move {
                let cause = if i % 2 == 0 {
                    ShutdownCause::Interrupt
                } else {
                    accept_failure()
                };
                signal.trigger(cause)
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_waiters_observe_same_cause() {
        let signal = ShutdownSignal::new();

        let waiter_a = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });
        let waiter_b = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });

        tokio::task::yield_now().await;
        signal.trigger(accept_failure());

        let a = tokio::time::timeout(Duration::from_secs(1), waiter_a)
            .await
            .unwrap()
            .unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), waiter_b)
            .await
            .unwrap()
            .unwrap();
        assert!(a.is_fatal());
        assert!(b.is_fatal());
    }

    #[tokio::test]
    async fn test_coordinator_external_trigger() {
        let signal = ShutdownSignal::new();
        let coordinator = ShutdownCoordinator::new(signal.clone());

        let cause = coordinator
            .wait_for_trigger(async { ShutdownCause::Terminate })
            .await;
        assert!(matches!(cause, ShutdownCause::Terminate));
        assert!(matches!(signal.cause(), Some(ShutdownCause::Terminate)));
    }

    #[tokio::test]
    async fn test_coordinator_prefers_latched_failure() {
        let signal = ShutdownSignal::new();
        signal.trigger(accept_failure());

        let coordinator = ShutdownCoordinator::new(signal);
        let cause = coordinator
            .wait_for_trigger(async { ShutdownCause::Interrupt })
            .await;
        assert!(cause.is_fatal());
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(
            ShutdownCause::Interrupt.to_string(),
            "interrupt signal received"
        );
        assert!(accept_failure().to_string().contains("too many open files"));
    }
}
