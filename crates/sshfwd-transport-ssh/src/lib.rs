//! SSH transport implementation using russh
//!
//! The tunnel session is a single authenticated SSH connection; each logical
//! stream is a `direct-tcpip` channel (RFC 4254 §7.2) asking the SSH server
//! to connect onward to the target on our behalf.
//!
//! # Example
//!
//! ```no_run
//! use sshfwd_transport::{Credentials, TargetAddr, TunnelConnector, TunnelSession};
//! use sshfwd_transport_ssh::{SshConfig, SshConnector};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = SshConnector::new(Arc::new(SshConfig::client_default()))?;
//! let credentials = Credentials::select("deploy", None, None, Some("secret".into()))?;
//! let session = connector.connect("bastion.example.com:22", &credentials).await?;
//!
//! let target: TargetAddr = "10.0.0.5:5432".parse()?;
//! let _stream = session.open_stream(&target, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod session;

pub use config::SshConfig;
pub use connector::{load_identity, SshConnector};
pub use session::SshSession;
