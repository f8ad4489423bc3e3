//! Client error type

use crate::handshake::HandshakeError;
use crate::registry::RegistryError;
use thiserror::Error;
use tunlink_connection::ReconnectError;
use tunlink_proto::{EngineError, FrameError};
use tunlink_transport::{TlsError, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("Control connection error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Reconnection failed: {0}")]
    Reconnect(#[from] ReconnectError),

    #[error("Not connected")]
    NotConnected,

    #[error("Client has been shut down")]
    ShutDown,
}

impl ClientError {
    /// Returns true if retrying the same operation cannot succeed
    pub fn is_non_recoverable(&self) -> bool {
        match self {
            ClientError::ConfigError(_)
            | ClientError::Engine(_)
            | ClientError::Tls(_)
            | ClientError::Registry(_)
            | ClientError::ShutDown => true,
            ClientError::Handshake(e) => e.is_authentication_failure(),
            ClientError::Transport(TransportError::ConfigurationError(_)) => true,
            _ => false,
        }
    }

    /// Returns true if a retry might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
