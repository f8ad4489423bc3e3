//! Connection status, lifecycle events and the status report

use crate::registry::Tunnel;
use serde::Serialize;
use tunlink_connection::HeartbeatState;
use tunlink_proto::ProtocolContext;
use tunlink_transport::ConnectionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until `connect` is called again
    Error,
}

/// Broadcast to every [`subscribe_events`](crate::TunnelClient::subscribe_events) receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Connected { generation: u64 },
    Disconnected { reason: String },
    Reconnecting { attempt: usize },
    Reconnected { generation: u64 },
    ReconnectFailed { reason: String },
    TunnelActive { tunnel_id: String },
    TunnelFailed { tunnel_id: String, message: Option<String> },
    ServerError { message: String, code: Option<String> },
}

/// Serializable snapshot of the whole client
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub status: ConnectionStatus,
    pub protocol: ProtocolContext,
    pub connection: Option<ConnectionInfo>,
    pub heartbeat: HeartbeatState,
    pub tunnels: Vec<Tunnel>,
    pub last_error: Option<String>,
    pub last_handshake_error: Option<String>,
}
