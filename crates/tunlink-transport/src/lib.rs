//! Transport layer for the tunnel control connection
//!
//! Dials the relay over TCP, optionally wrapped in TLS, and hands back a
//! bidirectional stream for the framer.

pub mod connector;
pub mod tls;

pub use connector::{
    BoxedStream, ConnectionInfo, ConnectorConfig, StreamKind, TransportConnector, TransportStream,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use tls::{
    build_tls_config, ensure_crypto_provider, DevMode, PathPolicy, TlsError, TlsMaterial,
    TlsMaterialLoader, TlsSettings, DEFAULT_CERT_DIRS, DEFAULT_KEY_DIRS, DEV_MODE_ENV,
};

use std::time::Duration;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TlsError> for TransportError {
    fn from(err: TlsError) -> Self {
        TransportError::ConfigurationError(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
