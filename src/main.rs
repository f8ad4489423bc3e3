//! tunlink CLI - register TCP tunnels with a relay
//!
//! Connects to a relay, authenticates, advertises the requested tunnels and
//! keeps the control connection alive until Ctrl+C.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunlink_client::{
    ClientConfig, ConnectionStatus, HeartbeatConfig, NoopMetrics, ProtocolVersion,
    ReconnectConfig, TunnelClient, TunnelSpec,
};
use tunlink_connection::{ReconnectError, ReconnectManager};

/// tunlink - expose TCP services through a tunnel relay
#[derive(Parser, Debug)]
#[command(name = "tunlink")]
#[command(about = "tunlink - expose TCP services through a tunnel relay")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a relay and register tunnels
    #[command(long_about = r#"
Connect to a relay, authenticate and register one or more TCP tunnels.
The control connection is kept alive with heartbeats and re-established
automatically; registered tunnels are re-advertised after a reconnect.

EXAMPLES:
  # Protocol 2.0.0 with a tenant, forwarding RDP
  tunlink connect --host relay.example.com --port 4433 \
    --token $TUNLINK_TOKEN --protocol 2.0.0 --tenant-id acme \
    --tls --tunnel 3389:internal-host:3389

ENVIRONMENT VARIABLES:
  TUNLINK_HOST       Relay host
  TUNLINK_PORT       Relay port
  TUNLINK_TOKEN      Authentication token
  TUNLINK_TENANT_ID  Tenant id (protocol 2.0.0)
  TUNLINK_PROTOCOL   Protocol version (1.0.0 or 2.0.0)
  TUNLINK_DEV_MODE   Set to 1/true/yes to skip certificate verification
    "#)]
    Connect {
        /// Relay host
        #[arg(long, env = "TUNLINK_HOST")]
        host: String,

        /// Relay port
        #[arg(long, env = "TUNLINK_PORT", default_value = "8443")]
        port: u16,

        /// Authentication token
        #[arg(long, env = "TUNLINK_TOKEN", hide_env_values = true)]
        token: String,

        /// Protocol version (1.0.0 or 2.0.0)
        #[arg(long, env = "TUNLINK_PROTOCOL", default_value = "1.0.0")]
        protocol: ProtocolVersion,

        /// Tenant id, required for protocol 2.0.0
        #[arg(long, env = "TUNLINK_TENANT_ID")]
        tenant_id: Option<String>,

        /// Wrap the control connection in TLS
        #[arg(long)]
        tls: bool,

        /// CA bundle to trust instead of the built-in roots
        #[arg(long, env = "TUNLINK_CA")]
        ca: Option<PathBuf>,

        /// Client certificate (requires --key)
        #[arg(long, env = "TUNLINK_CERT", requires = "key")]
        cert: Option<PathBuf>,

        /// Client private key (requires --cert)
        #[arg(long, env = "TUNLINK_KEY", requires = "cert")]
        key: Option<PathBuf>,

        /// TLS server name, if different from --host
        #[arg(long)]
        server_name: Option<String>,

        /// Tunnel as LOCAL_PORT:REMOTE_HOST:REMOTE_PORT (repeatable)
        #[arg(long = "tunnel", value_name = "LOCAL:HOST:REMOTE")]
        tunnels: Vec<String>,

        /// Heartbeat interval in seconds
        #[arg(long, default_value = "30")]
        heartbeat_interval: u64,

        /// Maximum reconnection attempts per outage (0 = infinite)
        #[arg(long, default_value = "5")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

/// Setup logging; RUST_LOG takes precedence over --verbose
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

/// Parse `LOCAL:HOST:REMOTE`
fn parse_tunnel(value: &str) -> Result<TunnelSpec> {
    let (local, rest) = value
        .split_once(':')
        .with_context(|| format!("Invalid tunnel {:?}: expected LOCAL:HOST:REMOTE", value))?;
    let (host, remote) = rest
        .rsplit_once(':')
        .with_context(|| format!("Invalid tunnel {:?}: expected LOCAL:HOST:REMOTE", value))?;

    let local_port = local
        .parse()
        .with_context(|| format!("Invalid local port in {:?}", value))?;
    let remote_port = remote
        .parse()
        .with_context(|| format!("Invalid remote port in {:?}", value))?;
    if host.is_empty() {
        bail!("Invalid tunnel {:?}: empty host", value);
    }

    Ok(TunnelSpec::new(local_port, host, remote_port))
}

/// Initial connection, retried with backoff unless the failure is permanent
async fn connect_with_retry(
    client: &TunnelClient,
    reconnect: ReconnectConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut backoff = ReconnectManager::new(reconnect);

    loop {
        match client.connect().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_non_recoverable() => {
                return Err(e).context("Failed to connect to relay");
            }
            Err(e) => warn!("Connection attempt {} failed: {}", backoff.attempt() + 1, e),
        }

        match backoff.wait(cancel).await {
            Ok(()) => {}
            Err(ReconnectError::Cancelled) => bail!("Cancelled"),
            Err(e) => return Err(e).context("Failed to connect to relay"),
        }
    }
}

/// Resolves once the client gives up on the relay
async fn wait_for_failure(client: &TunnelClient) {
    let mut status = client.subscribe_status();
    loop {
        if *status.borrow_and_update() == ConnectionStatus::Error {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Connect {
            host,
            port,
            token,
            protocol,
            tenant_id,
            tls,
            ca,
            cert,
            key,
            server_name,
            tunnels,
            heartbeat_interval,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            info!("tunlink starting...");

            let specs = tunnels
                .iter()
                .map(String::as_str)
                .map(parse_tunnel)
                .collect::<Result<Vec<_>>>()?;

            let reconnect = ReconnectConfig {
                initial_backoff: Duration::from_secs(reconnect_delay),
                max_backoff: Duration::from_secs(max_reconnect_delay),
                max_attempts: (max_reconnect_attempts > 0).then_some(max_reconnect_attempts),
                ..ReconnectConfig::default()
            };

            let mut builder = ClientConfig::builder()
                .host(host.clone())
                .port(port)
                .token(token)
                .protocol_version(protocol)
                .tls(tls)
                .heartbeat(HeartbeatConfig {
                    interval: Duration::from_secs(heartbeat_interval.max(1)),
                    ..HeartbeatConfig::default()
                })
                .reconnect(reconnect.clone());
            if let Some(tenant_id) = tenant_id {
                builder = builder.tenant_id(tenant_id);
            }
            if let Some(ca) = ca {
                builder = builder.ca_path(ca);
            }
            if let (Some(cert), Some(key)) = (cert, key) {
                builder = builder.client_cert(cert, key);
            }
            if let Some(server_name) = server_name {
                builder = builder.server_name(server_name);
            }
            let config = builder.build().context("Invalid configuration")?;

            info!("Relay: {}:{}", host, port);
            info!("Protocol: {}", protocol);
            if config.tls.dev_mode.skips_verification() {
                warn!("Certificate verification disabled (TUNLINK_DEV_MODE)");
            }

            let client = TunnelClient::new(config, Arc::new(NoopMetrics))
                .context("Failed to create client")?;

            let cancel = CancellationToken::new();
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C before the relay answered");
                    cancel.cancel();
                    client.shutdown().await;
                    return Ok(());
                }
                result = connect_with_retry(&client, reconnect, &cancel) => result?,
            }

            for spec in specs {
                let id = client
                    .create_tunnel_with(spec)
                    .await
                    .context("Failed to create tunnel")?;
                info!("Tunnel registered: {}", id);
            }

            let outcome = tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down...");
                    Ok(())
                }
                _ = wait_for_failure(&client) => {
                    let reason = client
                        .last_error()
                        .await
                        .unwrap_or_else(|| "unknown error".to_string());
                    error!("Relay connection lost for good: {}", reason);
                    Err(anyhow::anyhow!(reason))
                }
            };

            match serde_json::to_string(&client.status_report().await) {
                Ok(report) => info!("Final status: {}", report),
                Err(e) => warn!("Could not serialize status: {}", e),
            }
            client.shutdown().await;

            info!("tunlink stopped");
            outcome
        }
    }
}
