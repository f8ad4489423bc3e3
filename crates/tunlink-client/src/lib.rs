//! Tunnel client
//!
//! Connects to a relay over the newline-delimited JSON control protocol,
//! authenticates, registers TCP tunnels and keeps the connection alive with
//! heartbeats and automatic reconnection.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunlink_client::{ClientConfig, NoopMetrics, ProtocolVersion, TunnelClient};
//!
//! # async fn run() -> Result<(), tunlink_client::ClientError> {
//! let config = ClientConfig::builder()
//!     .host("relay.example.com")
//!     .port(4433)
//!     .token("secret")
//!     .protocol_version(ProtocolVersion::V2)
//!     .tenant_id("acme")
//!     .build()?;
//!
//! let client = TunnelClient::new(config, Arc::new(NoopMetrics))?;
//! client.connect().await?;
//! let id = client.create_tunnel(3389, "internal-host", 3389).await?;
//! println!("tunnel {} registered", id);
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod status;

pub use client::TunnelClient;
pub use config::{ClientConfig, ClientConfigBuilder, TimeoutConfig};
pub use error::{ClientError, ClientResult};
pub use handshake::{HandshakeCoordinator, HandshakeError, HandshakeOutcome, HandshakeState};
pub use metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot, NoopMetrics};
pub use registry::{
    tunnel_id, PortRole, RegistryError, Tunnel, TunnelRegistry, TunnelSpec, TunnelStatus,
};
pub use session::Session;
pub use status::{ClientEvent, ClientStatus, ConnectionStatus};

pub use tunlink_connection::{HeartbeatConfig, HeartbeatState, ReconnectConfig};
pub use tunlink_proto::{Feature, ProtocolContext, ProtocolVersion};
pub use tunlink_transport::{DevMode, PathPolicy, TlsMaterialLoader, TlsSettings};
