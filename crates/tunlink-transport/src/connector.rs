//! TCP / TLS-over-TCP connector

use crate::tls::TlsMaterial;
use crate::{TransportError, TransportResult};
use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use uuid::Uuid;

/// Default bound on dial plus TLS handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub connect_timeout: Duration,
    /// `None` means plain TCP
    pub tls: Option<TlsMaterial>,
    /// SNI override; the dialed host is used otherwise
    pub server_name: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: None,
            server_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Plain,
    Tls,
}

/// Metadata about an established transport
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub remote_addr: SocketAddr,
    pub kind: StreamKind,
    pub created_at: DateTime<Utc>,
}

/// Object-safe bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An established connection to the relay
pub struct TransportStream {
    io: BoxedStream,
    info: ConnectionInfo,
}

impl TransportStream {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn into_split(
        self,
    ) -> (
        ReadHalf<BoxedStream>,
        WriteHalf<BoxedStream>,
        ConnectionInfo,
    ) {
        let (read, write) = tokio::io::split(self.io);
        (read, write, self.info)
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Dials the relay. Never retries; that is the caller's decision.
#[derive(Clone)]
pub struct TransportConnector {
    config: ConnectorConfig,
    tls_connector: Option<TlsConnector>,
}

impl std::fmt::Debug for TransportConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnector")
            .field("config", &self.config)
            .field("tls", &self.uses_tls())
            .finish_non_exhaustive()
    }
}

impl TransportConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let tls_connector = config
            .tls
            .as_ref()
            .map(|material| TlsConnector::from(material.client_config.clone()));
        Self {
            config,
            tls_connector,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn uses_tls(&self) -> bool {
        self.tls_connector.is_some()
    }

    /// Dial `host:port`, performing the TLS handshake when configured.
    /// The whole operation is bounded by the connect timeout.
    pub async fn connect(&self, host: &str, port: u16) -> TransportResult<TransportStream> {
        let timeout = self.config.connect_timeout;
        tokio::time::timeout(timeout, self.establish(host, port))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn establish(&self, host: &str, port: u16) -> TransportResult<TransportStream> {
        debug!("Connecting to {}:{}", host, port);

        let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
            TransportError::ConnectionError(format!("{}:{}: {}", host, port, e))
        })?;
        let remote_addr = tcp.peer_addr()?;
        tcp.set_nodelay(true)?;

        let (io, kind): (BoxedStream, StreamKind) = match &self.tls_connector {
            Some(connector) => {
                let name = self.config.server_name.as_deref().unwrap_or(host);
                let server_name = ServerName::try_from(name.to_string()).map_err(|e| {
                    TransportError::TlsError(format!("Invalid server name {}: {}", name, e))
                })?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TransportError::TlsError(e.to_string()))?;
                (Box::new(tls), StreamKind::Tls)
            }
            None => (Box::new(tcp), StreamKind::Plain),
        };

        let info = ConnectionInfo {
            connection_id: Uuid::new_v4(),
            remote_addr,
            kind,
            created_at: Utc::now(),
        };
        info!(
            "Connected to {} ({:?}, id {})",
            info.remote_addr, info.kind, info.connection_id
        );

        Ok(TransportStream { io, info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_connector_debug_hides_tls_internals() {
        let connector = TransportConnector::new(ConnectorConfig::default());
        let rendered = format!("{:?}", connector);
        assert!(rendered.starts_with("TransportConnector"));
        assert!(rendered.contains("tls: false"));
    }

    #[tokio::test]
    async fn test_plain_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let connector = TransportConnector::new(ConnectorConfig::default());
        assert!(!connector.uses_tls());

        let stream = connector.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(stream.info().kind, StreamKind::Plain);
        assert_eq!(stream.info().remote_addr.port(), port);

        let (mut read, mut write, _) = stream.into_split();
        write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        // bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TransportConnector::new(ConnectorConfig::default());
        let err = connector.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_connection_error() {
        let connector = TransportConnector::new(ConnectorConfig::default());
        let err = connector
            .connect("no-such-host.invalid", 4433)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectionError(_) | TransportError::Timeout(_)
        ));
    }
}
