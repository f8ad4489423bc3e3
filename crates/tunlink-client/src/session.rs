//! One authenticated control connection
//!
//! A session owns the write half behind a mutex and runs two tasks: the
//! reader, which dispatches everything the relay sends, and the heartbeat
//! supervisor. Either task reports the session's death at most once through
//! the death channel, tagged with the session generation.

use crate::metrics::{self, MetricsSink};
use crate::registry::{TunnelRegistry, TunnelStatus};
use crate::status::ClientEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tunlink_connection::{HeartbeatExit, HeartbeatSender, HeartbeatSupervisor};
use tunlink_proto::{Envelope, FrameError, FrameReader, FrameWriter};
use tunlink_transport::{BoxedStream, ConnectionInfo};

pub(crate) type SessionReader = FrameReader<ReadHalf<BoxedStream>>;
pub(crate) type SessionWriter = FrameWriter<WriteHalf<BoxedStream>>;

const ACK_CHANNEL_CAPACITY: usize = 16;

/// A session that stopped working
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionDeath {
    pub generation: u64,
    pub reason: String,
}

/// Handles the session tasks need from the client
#[derive(Clone)]
pub(crate) struct SessionLink {
    pub registry: Arc<TunnelRegistry>,
    pub metrics: Arc<dyn MetricsSink>,
    pub events: broadcast::Sender<ClientEvent>,
    pub deaths: mpsc::UnboundedSender<SessionDeath>,
    pub heartbeat: Arc<HeartbeatSupervisor>,
}

pub struct Session {
    generation: u64,
    info: ConnectionInfo,
    writer: Mutex<SessionWriter>,
    cancel: CancellationToken,
    closed: AtomicBool,
    death_reported: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        generation: u64,
        info: ConnectionInfo,
        writer: SessionWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            generation,
            info,
            writer: Mutex::new(writer),
            cancel,
            closed: AtomicBool::new(false),
            death_reported: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), FrameError> {
        if self.is_closed() {
            return Err(FrameError::ConnectionClosed);
        }
        self.writer.lock().await.send(envelope).await
    }

    /// Stop both tasks and shut down the write side. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing session {}", self.generation);
        self.cancel.cancel();
        self.writer.lock().await.shutdown().await;
    }

    /// Start the reader and heartbeat tasks
    pub(crate) fn start(self: &Arc<Self>, reader: SessionReader, link: SessionLink) {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);

        tokio::spawn(read_loop(self.clone(), reader, ack_tx, link.clone()));
        tokio::spawn(heartbeat_loop(self.clone(), ack_rx, link));
    }

    fn report_death(&self, link: &SessionLink, reason: String) {
        if self.is_closed() || self.death_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Session {} lost: {}", self.generation, reason);
        let _ = link.deaths.send(SessionDeath {
            generation: self.generation,
            reason,
        });
    }

    async fn dispatch(
        &self,
        envelope: Envelope,
        acks: &mpsc::Sender<u64>,
        link: &SessionLink,
    ) -> Result<(), FrameError> {
        match envelope {
            Envelope::HeartbeatResponse(heartbeat) => {
                trace!("Heartbeat acknowledged: {:?}", heartbeat.timestamp);
                // a full channel already holds an ack for this round
                let _ = acks.try_send(heartbeat.timestamp.unwrap_or_default());
            }
            Envelope::Heartbeat(heartbeat) => {
                self.send(&Envelope::heartbeat_response(heartbeat.timestamp))
                    .await?;
            }
            Envelope::TunnelResponse(response) => {
                let status = if response.is_success() {
                    TunnelStatus::Active
                } else {
                    TunnelStatus::Failed
                };

                if link
                    .registry
                    .set_status(&response.tunnel_id, status)
                    .await
                    .is_err()
                {
                    debug!("tunnel_response for unknown tunnel {}", response.tunnel_id);
                    return Ok(());
                }

                let event = if status == TunnelStatus::Active {
                    ClientEvent::TunnelActive {
                        tunnel_id: response.tunnel_id,
                    }
                } else {
                    warn!(
                        "Relay rejected tunnel {}: {}",
                        response.tunnel_id,
                        response.message.as_deref().unwrap_or(&response.status)
                    );
                    ClientEvent::TunnelFailed {
                        tunnel_id: response.tunnel_id,
                        message: response.message,
                    }
                };
                let active = link.registry.count_with_status(TunnelStatus::Active).await;
                link.metrics.gauge(metrics::TUNNELS_ACTIVE, active as i64);
                let _ = link.events.send(event);
            }
            Envelope::Error(error) => {
                warn!(
                    "Relay error{}: {}",
                    error
                        .code
                        .as_deref()
                        .map(|c| format!(" [{}]", c))
                        .unwrap_or_default(),
                    error.message
                );
                link.metrics.increment(metrics::SERVER_ERRORS_TOTAL, 1);
                let _ = link.events.send(ClientEvent::ServerError {
                    message: error.message,
                    code: error.code,
                });
            }
            other => debug!("Ignoring {} message", other.kind()),
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("info", &self.info)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    session: Arc<Session>,
    mut reader: SessionReader,
    acks: mpsc::Sender<u64>,
    link: SessionLink,
) {
    loop {
        let received = tokio::select! {
            _ = session.cancel.cancelled() => return,
            received = reader.receive() => received,
        };

        match received {
            Ok(envelope) => {
                if let Err(e) = session.dispatch(envelope, &acks, &link).await {
                    session.report_death(&link, format!("write failed: {}", e));
                    return;
                }
            }
            // liveness is the heartbeat's job
            Err(e) if e.is_timeout() => trace!("Control connection idle"),
            Err(e) => {
                session.report_death(&link, format!("read failed: {}", e));
                return;
            }
        }
    }
}

struct SessionHeartbeat {
    session: Arc<Session>,
    metrics: Arc<dyn MetricsSink>,
}

#[async_trait]
impl HeartbeatSender for SessionHeartbeat {
    async fn send_heartbeat(&self, timestamp_ms: u64) -> Result<(), String> {
        self.session
            .send(&Envelope::heartbeat(timestamp_ms))
            .await
            .map_err(|e| e.to_string())?;
        self.metrics.increment(metrics::HEARTBEATS_SENT_TOTAL, 1);
        Ok(())
    }

    fn record_miss(&self, _missed: u32) {
        self.metrics.increment(metrics::HEARTBEATS_MISSED_TOTAL, 1);
    }
}

async fn heartbeat_loop(session: Arc<Session>, mut acks: mpsc::Receiver<u64>, link: SessionLink) {
    let sender = SessionHeartbeat {
        session: session.clone(),
        metrics: link.metrics.clone(),
    };

    match link.heartbeat.run(&sender, &mut acks, &session.cancel).await {
        HeartbeatExit::Cancelled => debug!("Heartbeat for session {} stopped", session.generation),
        HeartbeatExit::Exhausted { missed } => {
            session.report_death(&link, format!("{} heartbeats missed", missed))
        }
    }
}
