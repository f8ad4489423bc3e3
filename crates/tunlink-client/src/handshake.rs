//! Hello/auth exchange on a fresh transport
//!
//! Protocol 2.0.0 clients greet first; 1.0.0 clients wait for the relay's
//! hello before answering with their own. Both then authenticate. A failed
//! handshake is final for that transport.

use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use tunlink_proto::{Envelope, FrameError, FrameReader, FrameWriter, ProtocolEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    HelloSent,
    HelloReceived,
    AuthSent,
    Authenticated,
    Failed,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol mismatch: expected {expected}, received {received}")]
    ProtocolMismatch {
        expected: &'static str,
        received: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl HandshakeError {
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, HandshakeError::AuthenticationFailed(_))
    }
}

/// What the relay told us during a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub server_version: String,
    pub server_features: Vec<String>,
    pub message: Option<String>,
}

pub struct HandshakeCoordinator {
    engine: Arc<dyn ProtocolEngine>,
    token: String,
    state: HandshakeState,
}

impl HandshakeCoordinator {
    pub fn new(engine: Arc<dyn ProtocolEngine>, token: impl Into<String>) -> Self {
        Self {
            engine,
            token: token.into(),
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the handshake. Each receive is bounded by the reader's timeout.
    pub async fn run<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<HandshakeOutcome, HandshakeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.state != HandshakeState::Idle {
            warn!("Handshake coordinator reused in state {:?}", self.state);
        }

        let result = self.exchange(reader, writer).await;
        match &result {
            Ok(outcome) => info!(
                "Handshake complete (client {}, server {})",
                self.engine.version(),
                outcome.server_version
            ),
            Err(e) => {
                warn!("Handshake failed in state {:?}: {}", self.state, e);
                self.state = HandshakeState::Failed;
            }
        }
        result
    }

    async fn exchange<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<HandshakeOutcome, HandshakeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let server_hello = if self.engine.sends_hello_first() {
            writer.send(&self.engine.hello()).await?;
            self.state = HandshakeState::HelloSent;

            let hello = expect_hello(reader.receive().await?)?;
            self.state = HandshakeState::HelloReceived;
            hello
        } else {
            let hello = expect_hello(reader.receive().await?)?;
            self.state = HandshakeState::HelloReceived;

            writer.send(&self.engine.hello()).await?;
            self.state = HandshakeState::HelloSent;
            hello
        };
        debug!(
            "Relay hello: version {}, features {:?}",
            server_hello.version, server_hello.features
        );

        writer.send(&self.engine.auth(&self.token)).await?;
        self.state = HandshakeState::AuthSent;

        let response = match reader.receive().await? {
            Envelope::AuthResponse(response) => response,
            other => {
                return Err(HandshakeError::ProtocolMismatch {
                    expected: "auth_response",
                    received: other.kind().to_string(),
                })
            }
        };

        if !response.is_success() {
            return Err(HandshakeError::AuthenticationFailed(
                response
                    .message
                    .unwrap_or_else(|| "authentication failed".to_string()),
            ));
        }

        self.state = HandshakeState::Authenticated;
        Ok(HandshakeOutcome {
            server_version: server_hello.version,
            server_features: server_hello.features,
            message: response.message,
        })
    }
}

fn expect_hello(envelope: Envelope) -> Result<tunlink_proto::Hello, HandshakeError> {
    match envelope {
        Envelope::Hello(hello) => Ok(hello),
        other => Err(HandshakeError::ProtocolMismatch {
            expected: "hello",
            received: other.kind().to_string(),
        }),
    }
}
