//! In-process relay used by the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tunlink_client::{
    ClientConfig, ClientEvent, HeartbeatConfig, ProtocolVersion, ReconnectConfig,
};
use tunlink_proto::{
    AuthResponse, Envelope, FrameReader, FrameWriter, Hello, TunnelAction, TunnelResponse,
};

pub const WAIT: Duration = Duration::from_secs(5);

struct RelayState {
    version: ProtocolVersion,
    accept_auth: Arc<AtomicBool>,
    answer_heartbeats: Arc<AtomicBool>,
    answer_tunnels: Arc<AtomicBool>,
    seen: mpsc::UnboundedSender<(usize, Envelope)>,
    push: broadcast::Sender<Envelope>,
    kick: broadcast::Sender<()>,
    stopped: CancellationToken,
}

/// A relay speaking one protocol version. Records every message it receives
/// together with the index of the connection it arrived on.
pub struct FakeRelay {
    pub port: u16,
    pub accepted: Arc<AtomicUsize>,
    pub accept_auth: Arc<AtomicBool>,
    pub answer_heartbeats: Arc<AtomicBool>,
    pub answer_tunnels: Arc<AtomicBool>,
    seen: Mutex<mpsc::UnboundedReceiver<(usize, Envelope)>>,
    push: broadcast::Sender<Envelope>,
    kick: broadcast::Sender<()>,
    stopped: CancellationToken,
}

impl FakeRelay {
    pub async fn start(version: ProtocolVersion) -> Self {
        Self::start_with(version, None).await
    }

    pub async fn start_with(version: ProtocolVersion, tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accepted = Arc::new(AtomicUsize::new(0));
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(16);
        let (kick, _) = broadcast::channel(4);
        let stopped = CancellationToken::new();
        let state = Arc::new(RelayState {
            version,
            accept_auth: Arc::new(AtomicBool::new(true)),
            answer_heartbeats: Arc::new(AtomicBool::new(true)),
            answer_tunnels: Arc::new(AtomicBool::new(true)),
            seen: seen_tx,
            push: push.clone(),
            kick: kick.clone(),
            stopped: stopped.clone(),
        });

        let relay = Self {
            port,
            accepted: accepted.clone(),
            accept_auth: state.accept_auth.clone(),
            answer_heartbeats: state.answer_heartbeats.clone(),
            answer_tunnels: state.answer_tunnels.clone(),
            seen: Mutex::new(seen_rx),
            push,
            kick,
            stopped: stopped.clone(),
        };

        tokio::spawn(async move {
            loop {
                let accepted_socket = tokio::select! {
                    _ = stopped.cancelled() => return,
                    accepted_socket = listener.accept() => accepted_socket,
                };
                let Ok((socket, _)) = accepted_socket else {
                    return;
                };
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                let state = state.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => {
                            if let Ok(stream) = acceptor.accept(socket).await {
                                serve(stream, index, state).await;
                            }
                        }
                        None => serve(socket, index, state).await,
                    }
                });
            }
        });

        relay
    }

    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Close every live connection; the listener keeps accepting
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }

    /// Stop listening and close every connection
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    /// Send a message on every live connection
    pub fn push(&self, envelope: Envelope) {
        let _ = self.push.send(envelope);
    }

    pub async fn next_message(&self) -> (usize, Envelope) {
        tokio::time::timeout(WAIT, self.seen.lock().await.recv())
            .await
            .expect("relay saw nothing in time")
            .expect("relay stopped")
    }

    /// Next message of the given `type`, skipping everything else
    pub async fn next_of_kind(&self, kind: &str) -> (usize, Envelope) {
        loop {
            let (index, envelope) = self.next_message().await;
            if envelope.kind() == kind {
                return (index, envelope);
            }
        }
    }
}

fn relay_hello(version: ProtocolVersion) -> Envelope {
    Envelope::Hello(Hello {
        version: version.to_string(),
        features: vec!["tls".to_string(), "tunneling".to_string()],
    })
}

async fn serve<S>(stream: S, index: usize, state: Arc<RelayState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::with_timeout(read, Duration::from_secs(3600));
    let mut writer = FrameWriter::new(write);
    let mut pushed = state.push.subscribe();
    let mut kicked = state.kick.subscribe();

    let greets_first = state.version == ProtocolVersion::V1;
    if greets_first && writer.send(&relay_hello(state.version)).await.is_err() {
        return;
    }

    let Ok(hello) = reader.receive().await else {
        return;
    };
    let _ = state.seen.send((index, hello));
    if !greets_first && writer.send(&relay_hello(state.version)).await.is_err() {
        return;
    }

    let Ok(auth) = reader.receive().await else {
        return;
    };
    let _ = state.seen.send((index, auth));

    if !state.accept_auth.load(Ordering::SeqCst) {
        let _ = writer
            .send(&Envelope::AuthResponse(AuthResponse {
                status: "failed".to_string(),
                message: Some("invalid token".to_string()),
            }))
            .await;
        return;
    }
    if writer
        .send(&Envelope::AuthResponse(AuthResponse {
            status: AuthResponse::SUCCESS.to_string(),
            message: None,
        }))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = kicked.recv() => return,
            _ = state.stopped.cancelled() => return,
            received = reader.receive() => {
                let Ok(envelope) = received else {
                    return;
                };
                let reply = match &envelope {
                    Envelope::Heartbeat(hb) if state.answer_heartbeats.load(Ordering::SeqCst) => {
                        Some(Envelope::heartbeat_response(hb.timestamp))
                    }
                    Envelope::TunnelInfo(info)
                        if info.action == TunnelAction::Open
                            && state.answer_tunnels.load(Ordering::SeqCst) =>
                    {
                        Some(Envelope::TunnelResponse(TunnelResponse {
                            tunnel_id: info.tunnel_id.clone(),
                            status: "success".to_string(),
                            message: None,
                        }))
                    }
                    _ => None,
                };
                let _ = state.seen.send((index, envelope));
                if let Some(reply) = reply {
                    if writer.send(&reply).await.is_err() {
                        return;
                    }
                }
            }
            pushed = pushed.recv() => {
                if let Ok(envelope) = pushed {
                    if writer.send(&envelope).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Client configuration with timings short enough for tests
pub fn fast_config(port: u16, version: ProtocolVersion) -> ClientConfig {
    let builder = ClientConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .token("T")
        .protocol_version(version)
        .heartbeat(HeartbeatConfig {
            interval: Duration::from_millis(200),
            timeout: Duration::from_millis(200),
            max_missed: 2,
        })
        .reconnect(ReconnectConfig {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_attempts: Some(5),
        });

    let builder = match version {
        ProtocolVersion::V2 => builder.tenant_id("tenant1"),
        ProtocolVersion::V1 => builder,
    };
    builder.build().unwrap()
}

pub async fn expect_event<F>(
    events: &mut broadcast::Receiver<ClientEvent>,
    matches: F,
) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {}", e),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}
