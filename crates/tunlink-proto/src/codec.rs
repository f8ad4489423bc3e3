//! Newline-delimited JSON framing for [`Envelope`]s
//!
//! Every envelope is one JSON object followed by `\n`. Lines are capped at
//! [`MAX_MESSAGE_SIZE`] in both directions and every read or write is bounded
//! by a deadline.

use crate::messages::Envelope;
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::trace;

/// Maximum serialized envelope size (1 MiB), newline excluded
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default deadline for a single `receive`
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a single `send`
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Message too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FrameError::Timeout(_))
    }
}

/// Serialize an envelope into its wire line (newline included).
///
/// Fails with [`FrameError::MessageTooLarge`] before anything is written.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, FrameError> {
    let mut line =
        serde_json::to_string(envelope).map_err(|e| FrameError::Malformed(e.to_string()))?;

    if line.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::MessageTooLarge(line.len()));
    }

    line.push('\n');
    Ok(line)
}

/// Read half of a framed connection
pub struct FrameReader<R> {
    inner: FramedRead<R, LinesCodec>,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_timeout(reader, DEFAULT_READ_TIMEOUT)
    }

    pub fn with_timeout(reader: R, read_timeout: Duration) -> Self {
        Self {
            inner: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE)),
            read_timeout,
        }
    }

    /// Receive the next envelope.
    ///
    /// Cancel safe: bytes of a partially received line stay buffered in the
    /// underlying codec and are completed by the next call.
    pub async fn receive(&mut self) -> Result<Envelope, FrameError> {
        let next = tokio::time::timeout(self.read_timeout, self.inner.next())
            .await
            .map_err(|_| FrameError::Timeout(self.read_timeout))?;

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                return Err(FrameError::MessageTooLarge(MAX_MESSAGE_SIZE + 1))
            }
            Some(Err(LinesCodecError::Io(e))) => {
                return Err(match e.kind() {
                    std::io::ErrorKind::InvalidData => FrameError::Malformed(e.to_string()),
                    _ => FrameError::Io(e),
                })
            }
            None => return Err(FrameError::ConnectionClosed),
        };

        trace!("Received frame: {} bytes", line.len());

        Envelope::decode(&line).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

/// Write half of a framed connection
pub struct FrameWriter<W> {
    inner: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self::with_timeout(writer, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_timeout(writer: W, write_timeout: Duration) -> Self {
        Self {
            inner: writer,
            write_timeout,
        }
    }

    /// Send one envelope, flushing it before returning.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), FrameError> {
        let line = encode_envelope(envelope)?;
        let write_timeout = self.write_timeout;
        let inner = &mut self.inner;

        let write = async {
            inner.write_all(line.as_bytes()).await?;
            inner.flush().await
        };

        tokio::time::timeout(write_timeout, write)
            .await
            .map_err(|_| FrameError::Timeout(write_timeout))??;

        trace!("Sent {} frame: {} bytes", envelope.kind(), line.len());
        Ok(())
    }

    /// Shut down the write side. Errors are ignored; the peer may already be gone.
    pub async fn shutdown(&mut self) {
        let _ = tokio::time::timeout(self.write_timeout, self.inner.shutdown()).await;
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ErrorMessage, Hello};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_send_then_receive_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let hello = Envelope::Hello(Hello {
            version: "1.0.0".to_string(),
            features: vec!["tls".to_string()],
        });
        writer.send(&hello).await.unwrap();
        writer.send(&Envelope::heartbeat(7)).await.unwrap();

        assert_eq!(reader.receive().await.unwrap(), hello);
        assert_eq!(reader.receive().await.unwrap(), Envelope::heartbeat(7));
    }

    #[tokio::test]
    async fn test_oversized_send_writes_nothing() {
        let mut writer = FrameWriter::new(Vec::new());
        let envelope = Envelope::Error(ErrorMessage {
            message: "x".repeat(MAX_MESSAGE_SIZE),
            code: None,
        });

        let err = writer.send(&envelope).await.unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge(n) if n > MAX_MESSAGE_SIZE));
        assert!(writer.get_ref().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut reader = FrameReader::new(server);

        let writer = tokio::spawn(async move {
            let big = vec![b'a'; MAX_MESSAGE_SIZE + 16];
            let _ = client.write_all(&big).await;
            let _ = client.write_all(b"\n").await;
        });

        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge(_)));
        writer.abort();
    }

    #[tokio::test]
    async fn test_malformed_json_is_framing_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        client.write_all(b"{not json}\n").await.unwrap();
        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);
        drop(client);

        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::with_timeout(server, Duration::from_secs(30));

        let err = reader.receive().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_line_survives_timeout() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::with_timeout(server, Duration::from_secs(1));

        client.write_all(br#"{"type":"heartbeat","#).await.unwrap();
        assert!(reader.receive().await.unwrap_err().is_timeout());

        client.write_all(b"\"timestamp\":3}\n").await.unwrap();
        assert_eq!(reader.receive().await.unwrap(), Envelope::heartbeat(3));
    }

    #[test]
    fn test_encode_appends_single_newline() {
        let line = encode_envelope(&Envelope::heartbeat(1)).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
