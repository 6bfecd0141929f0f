//! sshfwd - forward a local TCP port to a remote endpoint through SSH
//!
//! Every connection accepted on the local address is carried over one
//! authenticated SSH session as its own `direct-tcpip` channel.

use anyhow::{Context, Result};
use clap::Parser;
use sshfwd_forward::{os_signal, ForwarderConfig, PairErrorPolicy};
use sshfwd_transport::Credentials;
use sshfwd_transport_ssh::{SshConfig, SshConnector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Forward a local port to a remote address through an SSH server
#[derive(Parser, Debug)]
#[command(name = "sshfwd")]
#[command(about = "Forward a local port to a remote address through an SSH server")]
#[command(version = env!("SSHFWD_GIT_TAG"))]
#[command(long_version = concat!(env!("SSHFWD_GIT_TAG"), "\nCommit: ", env!("SSHFWD_GIT_HASH"), "\nBuilt: ", env!("SSHFWD_BUILD_TIME")))]
#[command(after_help = r#"EXAMPLES:
  # Reach a database behind a bastion on 127.0.0.1:15432
  sshfwd --local 127.0.0.1:15432 --ssh bastion.example.com:22 \
    --remote 10.0.0.5:5432 --user deploy --key ~/.ssh/id_ed25519

When both --key and --pwd are given, the key is used and the password ignored."#)]
struct Cli {
    /// Local address to listen on
    #[arg(long, env = "SSHFWD_LOCAL", default_value = ForwarderConfig::DEFAULT_LOCAL_ADDR)]
    local: String,

    /// SSH server address
    #[arg(long, env = "SSHFWD_SSH", default_value = ForwarderConfig::DEFAULT_SSH_HOST)]
    ssh: String,

    /// Remote address to forward to, as seen from the SSH server
    #[arg(long, env = "SSHFWD_REMOTE", default_value = "")]
    remote: String,

    /// SSH user
    #[arg(long, env = "SSHFWD_USER", default_value = "")]
    user: String,

    /// SSH password
    #[arg(long, env = "SSHFWD_PASSWORD", hide_env_values = true)]
    pwd: Option<String>,

    /// Private key file
    #[arg(long, env = "SSHFWD_KEY")]
    key: Option<PathBuf>,

    /// Passphrase of an encrypted private key
    #[arg(long, env = "SSHFWD_KEY_PASSPHRASE", hide_env_values = true)]
    key_passphrase: Option<String>,

    /// Close only the failed connection instead of shutting down on errors
    #[arg(long)]
    isolate_pair_errors: bool,

    /// Do not check that the remote address is reachable before listening
    #[arg(long)]
    skip_remote_check: bool,

    /// Seconds a half-closed connection may stay open
    #[arg(long, default_value = "5")]
    linger: u64,

    /// SSH connect timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// SSH keepalive interval in seconds (0 disables)
    #[arg(long, default_value = "15")]
    keepalive: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging; `RUST_LOG` takes precedence over `--verbose`
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn forwarder_config(cli: &Cli) -> Result<ForwarderConfig> {
    let credentials = Credentials::select(
        &cli.user,
        cli.key.clone(),
        cli.key_passphrase.clone(),
        cli.pwd.clone(),
    )
    .context("Invalid SSH credentials")?;

    let policy = if cli.isolate_pair_errors {
        PairErrorPolicy::Isolate
    } else {
        PairErrorPolicy::Shutdown
    };

    let config = ForwarderConfig::new(
        cli.local.as_str(),
        cli.ssh.as_str(),
        &cli.remote,
        credentials,
    )
    .context("Invalid forwarding configuration")?
    .with_pair_error_policy(policy)
    .with_verify_remote(!cli.skip_remote_check)
    .with_linger(Duration::from_secs(cli.linger))
    .context("Invalid --linger")?;

    Ok(config)
}

fn ssh_config(cli: &Cli) -> SshConfig {
    SshConfig::client_default()
        .with_connect_timeout(Duration::from_secs(cli.connect_timeout))
        .with_keepalive_interval(Duration::from_secs(cli.keepalive))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = forwarder_config(&cli)?;
    let connector =
        SshConnector::new(Arc::new(ssh_config(&cli))).context("Invalid SSH configuration")?;

    let cause = sshfwd_forward::run(Arc::new(config), &connector, os_signal())
        .await
        .context("Failed to start forwarding")?;

    if cause.is_fatal() {
        anyhow::bail!("forwarding stopped: {}", cause);
    }

    info!("sshfwd stopped");
    Ok(())
}
