//! Protocol message types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Wire envelope exchanged on the control connection.
///
/// Serialized as a single JSON object whose `type` field selects the variant.
/// `Unknown` is produced only by [`Envelope::decode`] for tags this client does
/// not understand; it is never sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Hello(Hello),
    Auth(Auth),
    AuthResponse(AuthResponse),
    TunnelInfo(TunnelInfo),
    TunnelResponse(TunnelResponse),
    Heartbeat(Heartbeat),
    HeartbeatResponse(Heartbeat),
    Error(ErrorMessage),
    #[serde(skip)]
    Unknown {
        kind: String,
        fields: Map<String, Value>,
    },
}

/// Tags with a typed payload. Anything else decodes to [`Envelope::Unknown`].
const KNOWN_TYPES: &[&str] = &[
    "hello",
    "auth",
    "auth_response",
    "tunnel_info",
    "tunnel_response",
    "heartbeat",
    "heartbeat_response",
    "error",
];

impl Envelope {
    /// The wire `type` tag of this envelope
    pub fn kind(&self) -> &str {
        match self {
            Envelope::Hello(_) => "hello",
            Envelope::Auth(_) => "auth",
            Envelope::AuthResponse(_) => "auth_response",
            Envelope::TunnelInfo(_) => "tunnel_info",
            Envelope::TunnelResponse(_) => "tunnel_response",
            Envelope::Heartbeat(_) => "heartbeat",
            Envelope::HeartbeatResponse(_) => "heartbeat_response",
            Envelope::Error(_) => "error",
            Envelope::Unknown { kind, .. } => kind,
        }
    }

    /// Decode one JSON line.
    ///
    /// Dispatch happens on the `type` tag: known tags must match their typed
    /// payload, unknown tags are preserved as an opaque map.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(serde::de::Error::custom("`type` must be a string")),
            None => return Err(serde::de::Error::missing_field("type")),
        };

        if KNOWN_TYPES.contains(&kind.as_str()) {
            return serde_json::from_value(value);
        }

        let mut fields = match value {
            Value::Object(map) => map,
            _ => return Err(serde::de::Error::custom("envelope must be a JSON object")),
        };
        fields.remove("type");
        Ok(Envelope::Unknown { kind, fields })
    }

    pub fn heartbeat(timestamp: u64) -> Self {
        Envelope::Heartbeat(Heartbeat {
            timestamp: Some(timestamp),
        })
    }

    pub fn heartbeat_response(timestamp: Option<u64>) -> Self {
        Envelope::HeartbeatResponse(Heartbeat { timestamp })
    }
}

/// Version and capability advertisement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    pub version: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Client OS/architecture metadata carried by v1 auth
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub os: String,
    pub arch: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Auth {
    pub token: String,
    pub version: String,
    /// v1 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
    /// v2 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthResponse {
    pub const SUCCESS: &'static str = "success";

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}

/// What a `tunnel_info` message asks the relay to do
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelAction {
    #[default]
    Open,
    Close,
}

/// Tunnel advertisement sent by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub action: TunnelAction,
}

/// Relay verdict on a tunnel advertisement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelResponse {
    pub tunnel_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TunnelResponse {
    pub const SUCCESS: &'static str = "success";

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}

/// Payload shared by `heartbeat` and `heartbeat_response`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Heartbeat {
    /// Sender clock in milliseconds since the Unix epoch, echoed in the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
