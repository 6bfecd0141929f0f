//! Local-to-remote TCP forwarding over a single tunnel session
//!
//! A [`TunnelForwarder`] establishes one session through a
//! [`TunnelConnector`](sshfwd_transport::TunnelConnector), binds the local
//! address and pairs every accepted client with its own logical stream to
//! the configured remote endpoint. Bytes are relayed unmodified in both
//! directions.
//!
//! All fatal conditions converge on one [`ShutdownSignal`]; the first one
//! wins and tears the listener and the tunnel down exactly once.
//!
//! # Example
//!
//! ```no_run
//! use sshfwd_forward::{os_signal, run, ForwarderConfig};
//! use sshfwd_transport::memory::MemoryConnector;
//! use sshfwd_transport::Credentials;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials::select("deploy", None, None, Some("secret".into()))?;
//! let config = ForwarderConfig::new("127.0.0.1:10080", "bastion:22", "db:5432", credentials)?;
//! let (connector, _remote) = MemoryConnector::new();
//!
//! let cause = run(Arc::new(config), &connector, os_signal()).await?;
//! println!("stopped: {}", cause);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod forwarder;
pub mod server;
pub mod shutdown;

pub use config::{ConfigError, ForwarderConfig, PairErrorPolicy};
pub use error::ForwardError;
pub use forwarder::{Direction, PairSummary, StreamForwarder};
pub use server::{run, TunnelForwarder};
pub use shutdown::{os_signal, ShutdownCause, ShutdownCoordinator, ShutdownSignal};
