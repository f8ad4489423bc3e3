//! Client configuration

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tunlink_connection::{duration_secs, HeartbeatConfig, ReconnectConfig};
use tunlink_proto::ProtocolVersion;
use tunlink_transport::{DevMode, TlsSettings};

/// Per-operation deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(with = "duration_secs")]
    pub connect: Duration,
    #[serde(with = "duration_secs")]
    pub read: Duration,
    #[serde(with = "duration_secs")]
    pub write: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Required for protocol 2.0.0
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls: TlsSettings,
    /// SNI override
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8443,
            token: String::new(),
            protocol_version: ProtocolVersion::default(),
            tenant_id: None,
            tls_enabled: false,
            tls: TlsSettings::default(),
            server_name: None,
            timeouts: TimeoutConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Builder with the dev-mode switch taken from the environment
    pub fn builder() -> ClientConfigBuilder {
        let mut config = ClientConfig::default();
        config.tls.dev_mode = DevMode::from_env();
        ClientConfigBuilder { config }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.host.trim().is_empty() {
            return Err(ClientError::ConfigError("host is required".to_string()));
        }
        if self.port == 0 {
            return Err(ClientError::ConfigError("port must be non-zero".to_string()));
        }
        if self.token.is_empty() {
            return Err(ClientError::ConfigError("token is required".to_string()));
        }
        if self.protocol_version == ProtocolVersion::V2
            && self
                .tenant_id
                .as_deref()
                .map_or(true, |t| t.trim().is_empty())
        {
            return Err(ClientError::ConfigError(format!(
                "tenant_id is required for protocol {}",
                self.protocol_version
            )));
        }
        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(ClientError::ConfigError(
                "cert_path and key_path must be set together".to_string(),
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(ClientError::ConfigError(
                "heartbeat max_missed must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.interval.is_zero() || self.heartbeat.timeout.is_zero() {
            return Err(ClientError::ConfigError(
                "heartbeat interval and timeout must be non-zero".to_string(),
            ));
        }
        let reconnect = &self.reconnect;
        if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
            return Err(ClientError::ConfigError(format!(
                "reconnect multiplier must be a finite number >= 1, got {}",
                reconnect.multiplier
            )));
        }
        if reconnect.initial_backoff > reconnect.max_backoff {
            return Err(ClientError::ConfigError(
                "reconnect initial_backoff must not exceed max_backoff".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.config.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.tls_enabled = enabled;
        self
    }

    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.ca_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.config.tls.cert_path = Some(cert.into());
        self.config.tls.key_path = Some(key.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = Some(name.into());
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ClientError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
