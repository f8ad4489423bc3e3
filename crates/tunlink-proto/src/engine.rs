//! Protocol engines for the two supported protocol generations
//!
//! The generation is an explicit configuration input; nothing here negotiates
//! or auto-detects it. Call sites hold an `Arc<dyn ProtocolEngine>` chosen
//! once by [`engine_for`].

use crate::messages::{Auth, ClientInfo, Envelope, Hello};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Protocol {0} requires a tenant id")]
    MissingTenant(ProtocolVersion),
}

/// Protocol generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProtocolVersion {
    #[default]
    #[serde(rename = "1.0.0")]
    V1,
    #[serde(rename = "2.0.0")]
    V2,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1.0.0",
            ProtocolVersion::V2 => "2.0.0",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.0.0" | "1" | "v1" => Ok(ProtocolVersion::V1),
            "2.0.0" | "2" | "v2" => Ok(ProtocolVersion::V2),
            other => Err(EngineError::UnsupportedVersion(other.to_string())),
        }
    }
}

/// Named capability advertised in `hello`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Tls,
    JwtAuth,
    Tunneling,
    QuicTransport,
    Http2,
    Heartbeat,
    TunnelInfo,
    MultiTenant,
    Proxy,
    Metrics,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Tls => "tls",
            Feature::JwtAuth => "jwt_auth",
            Feature::Tunneling => "tunneling",
            Feature::QuicTransport => "quic_transport",
            Feature::Http2 => "http2",
            Feature::Heartbeat => "heartbeat",
            Feature::TunnelInfo => "tunnel_info",
            Feature::MultiTenant => "multi_tenant",
            Feature::Proxy => "proxy",
            Feature::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const V1_FEATURES: &[Feature] = &[
    Feature::Tls,
    Feature::JwtAuth,
    Feature::Tunneling,
    Feature::QuicTransport,
    Feature::Http2,
];

const V2_FEATURES: &[Feature] = &[
    Feature::Tls,
    Feature::JwtAuth,
    Feature::Tunneling,
    Feature::QuicTransport,
    Feature::Http2,
    Feature::Heartbeat,
    Feature::TunnelInfo,
    Feature::MultiTenant,
    Feature::Proxy,
    Feature::Metrics,
];

/// Version-specific message construction
pub trait ProtocolEngine: Send + Sync + fmt::Debug {
    fn version(&self) -> ProtocolVersion;

    /// Declared capabilities. Advertisement only; the core never branches on these.
    fn features(&self) -> &'static [Feature];

    fn hello(&self) -> Envelope;

    fn auth(&self, token: &str) -> Envelope;

    /// Whether the client speaks first in the handshake
    fn sends_hello_first(&self) -> bool;

    fn tenant_id(&self) -> Option<&str> {
        None
    }

    fn context(&self) -> ProtocolContext {
        ProtocolContext {
            version: self.version(),
            features: self.features().to_vec(),
            tenant_id: self.tenant_id().map(str::to_string),
        }
    }
}

fn feature_names(features: &[Feature]) -> Vec<String> {
    features.iter().map(|f| f.as_str().to_string()).collect()
}

/// Protocol 1.0.0: passive greeting, OS/arch metadata in auth
#[derive(Debug, Clone, Default)]
pub struct V1Engine {
    client_info: ClientInfo,
}

impl V1Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_info(client_info: ClientInfo) -> Self {
        Self { client_info }
    }
}

impl ProtocolEngine for V1Engine {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    fn features(&self) -> &'static [Feature] {
        V1_FEATURES
    }

    fn hello(&self) -> Envelope {
        Envelope::Hello(Hello {
            version: self.version().to_string(),
            features: feature_names(self.features()),
        })
    }

    fn auth(&self, token: &str) -> Envelope {
        Envelope::Auth(Auth {
            token: token.to_string(),
            version: self.version().to_string(),
            client_info: Some(self.client_info.clone()),
            tenant_id: None,
        })
    }

    fn sends_hello_first(&self) -> bool {
        false
    }
}

/// Protocol 2.0.0: client-initiated greeting, tenant-scoped auth
#[derive(Debug, Clone)]
pub struct V2Engine {
    tenant_id: String,
}

impl V2Engine {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

impl ProtocolEngine for V2Engine {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V2
    }

    fn features(&self) -> &'static [Feature] {
        V2_FEATURES
    }

    fn hello(&self) -> Envelope {
        Envelope::Hello(Hello {
            version: self.version().to_string(),
            features: feature_names(self.features()),
        })
    }

    fn auth(&self, token: &str) -> Envelope {
        Envelope::Auth(Auth {
            token: token.to_string(),
            version: self.version().to_string(),
            client_info: None,
            tenant_id: Some(self.tenant_id.clone()),
        })
    }

    fn sends_hello_first(&self) -> bool {
        true
    }

    fn tenant_id(&self) -> Option<&str> {
        Some(&self.tenant_id)
    }
}

/// Select the engine for a configured version
pub fn engine_for(
    version: ProtocolVersion,
    tenant_id: Option<&str>,
) -> Result<Arc<dyn ProtocolEngine>, EngineError> {
    match version {
        ProtocolVersion::V1 => Ok(Arc::new(V1Engine::new())),
        ProtocolVersion::V2 => match tenant_id {
            Some(tenant) if !tenant.trim().is_empty() => Ok(Arc::new(V2Engine::new(tenant))),
            _ => Err(EngineError::MissingTenant(version)),
        },
    }
}

/// Immutable snapshot of the protocol in use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolContext {
    pub version: ProtocolVersion,
    pub features: Vec<Feature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!("1.0.0".parse::<ProtocolVersion>(), Ok(ProtocolVersion::V1));
        assert_eq!("2.0.0".parse::<ProtocolVersion>(), Ok(ProtocolVersion::V2));
        assert!("3.0.0".parse::<ProtocolVersion>().is_err());
        assert_eq!(
            serde_json::to_string(&ProtocolVersion::V2).unwrap(),
            "\"2.0.0\""
        );
    }

    #[test]
    fn test_v1_hello_and_auth() {
        let engine = V1Engine::with_client_info(ClientInfo {
            os: "linux".to_string(),
            arch: "aarch64".to_string(),
        });
        assert!(!engine.sends_hello_first());

        match engine.hello() {
            Envelope::Hello(hello) => {
                assert_eq!(hello.version, "1.0.0");
                assert_eq!(
                    hello.features,
                    vec!["tls", "jwt_auth", "tunneling", "quic_transport", "http2"]
                );
            }
            other => panic!("Expected hello, got {:?}", other),
        }

        match engine.auth("secret") {
            Envelope::Auth(auth) => {
                assert_eq!(auth.token, "secret");
                assert_eq!(auth.version, "1.0.0");
                assert_eq!(auth.client_info.unwrap().arch, "aarch64");
                assert_eq!(auth.tenant_id, None);
            }
            other => panic!("Expected auth, got {:?}", other),
        }
    }

    #[test]
    fn test_v2_hello_and_auth() {
        let engine = V2Engine::new("tenant1");
        assert!(engine.sends_hello_first());

        let features = engine.features();
        for extra in [
            Feature::Heartbeat,
            Feature::TunnelInfo,
            Feature::MultiTenant,
            Feature::Proxy,
            Feature::Metrics,
        ] {
            assert!(features.contains(&extra), "missing {}", extra);
        }
        assert!(V1_FEATURES.iter().all(|f| features.contains(f)));

        match engine.auth("T") {
            Envelope::Auth(auth) => {
                assert_eq!(auth.version, "2.0.0");
                assert_eq!(auth.tenant_id.as_deref(), Some("tenant1"));
                assert!(auth.client_info.is_none());
            }
            other => panic!("Expected auth, got {:?}", other),
        }
    }

    #[test]
    fn test_engine_for_requires_tenant_on_v2() {
        assert_eq!(
            engine_for(ProtocolVersion::V2, None).unwrap_err(),
            EngineError::MissingTenant(ProtocolVersion::V2)
        );
        assert!(engine_for(ProtocolVersion::V2, Some("  ")).is_err());

        let engine = engine_for(ProtocolVersion::V2, Some("tenant1")).unwrap();
        let context = engine.context();
        assert_eq!(context.version, ProtocolVersion::V2);
        assert_eq!(context.tenant_id.as_deref(), Some("tenant1"));

        let v1 = engine_for(ProtocolVersion::V1, Some("ignored")).unwrap();
        assert_eq!(v1.context().tenant_id, None);
    }
}
