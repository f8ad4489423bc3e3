//! Tunnel client orchestration
//!
//! `TunnelClient` ties the pieces together: it dials and authenticates the
//! control connection, keeps the tunnel registry, and runs one long-lived
//! supervisor task that reconnects after a session dies.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::handshake::HandshakeCoordinator;
use crate::metrics::{self, MetricsSink};
use crate::registry::{Tunnel, TunnelRegistry, TunnelSpec, TunnelStatus};
use crate::session::{Session, SessionDeath, SessionLink};
use crate::status::{ClientEvent, ClientStatus, ConnectionStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunlink_connection::{
    HeartbeatState, HeartbeatSupervisor, ReconnectError, ReconnectManager,
};
use tunlink_proto::{
    engine_for, Envelope, Feature, FrameReader, FrameWriter, ProtocolContext, ProtocolEngine,
    ProtocolVersion, TunnelAction,
};
use tunlink_transport::{
    ConnectionInfo, ConnectorConfig, TlsMaterialLoader, TransportConnector,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Shared {
    config: ClientConfig,
    engine: Arc<dyn ProtocolEngine>,
    connector: TransportConnector,
    registry: Arc<TunnelRegistry>,
    metrics: Arc<dyn MetricsSink>,
    heartbeat: Arc<HeartbeatSupervisor>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
    session: RwLock<Option<Arc<Session>>>,
    /// Serializes handshakes between `connect` and the reconnect supervisor
    handshake_lock: Mutex<()>,
    generation: AtomicU64,
    last_error: RwLock<Option<String>>,
    last_handshake_error: RwLock<Option<String>>,
    deaths: mpsc::UnboundedSender<SessionDeath>,
    death_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionDeath>>>,
    cancel: CancellationToken,
    terminated: AtomicBool,
}

/// Client for a tunnel relay
#[derive(Clone)]
pub struct TunnelClient {
    shared: Arc<Shared>,
}

impl TunnelClient {
    /// Create a client. Loads TLS material under the default path policy.
    pub fn new(config: ClientConfig, metrics: Arc<dyn MetricsSink>) -> ClientResult<Self> {
        Self::with_tls_loader(config, metrics, &TlsMaterialLoader::default())
    }

    pub fn with_tls_loader(
        config: ClientConfig,
        metrics: Arc<dyn MetricsSink>,
        loader: &TlsMaterialLoader,
    ) -> ClientResult<Self> {
        config.validate()?;
        let engine = engine_for(config.protocol_version, config.tenant_id.as_deref())?;

        let tls = if config.tls_enabled {
            Some(loader.load(&config.tls)?)
        } else {
            None
        };
        let connector = TransportConnector::new(ConnectorConfig {
            connect_timeout: config.timeouts.connect,
            tls,
            server_name: config.server_name.clone(),
        });

        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (deaths, death_rx) = mpsc::unbounded_channel();

        info!(
            "Tunnel client for {}:{} (protocol {}, tls {})",
            config.host,
            config.port,
            engine.version(),
            connector.uses_tls()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                heartbeat: Arc::new(HeartbeatSupervisor::new(config.heartbeat.clone())),
                config,
                engine,
                connector,
                registry: Arc::new(TunnelRegistry::new()),
                metrics,
                status,
                events,
                session: RwLock::new(None),
                handshake_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                last_error: RwLock::new(None),
                last_handshake_error: RwLock::new(None),
                deaths,
                death_rx: Mutex::new(Some(death_rx)),
                cancel: CancellationToken::new(),
                terminated: AtomicBool::new(false),
            }),
        })
    }

    /// Dial, authenticate and start the session tasks.
    ///
    /// A no-op when already connected.
    pub async fn connect(&self) -> ClientResult<()> {
        let shared = &self.shared;
        if shared.terminated.load(Ordering::SeqCst) {
            return Err(ClientError::ShutDown);
        }

        let result = {
            let _guard = shared.handshake_lock.lock().await;
            if self.is_connected() {
                return Ok(());
            }
            shared.status.send_replace(ConnectionStatus::Connecting);
            shared.establish().await
        };

        match result {
            Ok(generation) => {
                let _ = shared.events.send(ClientEvent::Connected { generation });
                self.start_supervisor().await;
                Ok(())
            }
            Err(e) => {
                let status = if e.is_non_recoverable() {
                    ConnectionStatus::Error
                } else {
                    ConnectionStatus::Disconnected
                };
                shared.status.send_replace(status);
                *shared.last_error.write().await = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn start_supervisor(&self) {
        let Some(death_rx) = self.shared.death_rx.lock().await.take() else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        let cancel = self.shared.cancel.clone();
        tokio::spawn(supervise(weak, death_rx, cancel));
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.status.borrow() == ConnectionStatus::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.shared.engine.version()
    }

    pub fn features(&self) -> &'static [Feature] {
        self.shared.engine.features()
    }

    pub fn protocol_context(&self) -> ProtocolContext {
        self.shared.engine.context()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.shared.last_error.read().await.clone()
    }

    pub async fn last_handshake_error(&self) -> Option<String> {
        self.shared.last_handshake_error.read().await.clone()
    }

    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.shared
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.info().clone())
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.shared.heartbeat.state()
    }

    /// Create a TCP tunnel and advertise it to the relay. Returns its id.
    pub async fn create_tunnel(
        &self,
        local_port: u32,
        remote_host: &str,
        remote_port: u32,
    ) -> ClientResult<String> {
        self.create_tunnel_with(TunnelSpec::new(local_port, remote_host, remote_port))
            .await
    }

    pub async fn create_tunnel_with(&self, spec: TunnelSpec) -> ClientResult<String> {
        let session = self.connected_session().await?;
        let tunnel = Tunnel::from_spec(spec)?;
        let id = tunnel.id.clone();
        let info = tunnel.info(TunnelAction::Open);

        let previous = self.shared.registry.swap(tunnel).await;

        if let Err(e) = session.send(&Envelope::TunnelInfo(info)).await {
            warn!("Failed to advertise tunnel {}: {}", id, e);
            self.shared.registry.revert(&id, previous).await;
            return Err(e.into());
        }
        if let Some(previous) = previous {
            previous.lifecycle().cancel();
        }

        info!("Created tunnel {}", id);
        Ok(id)
    }

    /// Remove a tunnel and tell the relay, if still connected
    pub async fn close_tunnel(&self, id: &str) -> ClientResult<()> {
        let tunnel = self.shared.registry.remove(id).await?;

        if let Some(session) = self.current_session().await {
            if let Err(e) = session
                .send(&Envelope::TunnelInfo(tunnel.info(TunnelAction::Close)))
                .await
            {
                debug!("Could not notify relay about closing {}: {}", id, e);
            }
        }

        self.shared.publish_active_tunnels().await;
        info!("Closed tunnel {}", id);
        Ok(())
    }

    pub async fn tunnels(&self) -> Vec<Tunnel> {
        self.shared.registry.list().await
    }

    pub async fn tunnel(&self, id: &str) -> Option<Tunnel> {
        self.shared.registry.get(id).await
    }

    pub async fn status_report(&self) -> ClientStatus {
        ClientStatus {
            status: self.status(),
            protocol: self.protocol_context(),
            connection: self.connection_info().await,
            heartbeat: self.heartbeat_state(),
            tunnels: self.tunnels().await,
            last_error: self.last_error().await,
            last_handshake_error: self.last_handshake_error().await,
        }
    }

    /// Stop everything. Idempotent; the client cannot reconnect afterwards.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down tunnel client");

        shared.cancel.cancel();
        if let Some(session) = shared.session.write().await.take() {
            session.close().await;
        }
        let closed = shared.registry.close_all().await;
        debug!("Closed {} tunnel(s)", closed);

        shared.metrics.gauge(metrics::TUNNELS_ACTIVE, 0);
        shared.status.send_replace(ConnectionStatus::Disconnected);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    async fn current_session(&self) -> Option<Arc<Session>> {
        self.shared.session.read().await.clone()
    }

    async fn connected_session(&self) -> ClientResult<Arc<Session>> {
        if self.is_shut_down() {
            return Err(ClientError::ShutDown);
        }
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        match self.current_session().await {
            Some(session) if !session.is_closed() => Ok(session),
            _ => Err(ClientError::NotConnected),
        }
    }
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Transport connect plus handshake. Callers hold `handshake_lock`.
    async fn establish(&self) -> ClientResult<u64> {
        let config = &self.config;
        let stream = self.connector.connect(&config.host, config.port).await?;
        let (read, write, info) = stream.into_split();
        let mut reader = FrameReader::with_timeout(read, config.timeouts.read);
        let mut writer = FrameWriter::with_timeout(write, config.timeouts.write);

        let mut handshake = HandshakeCoordinator::new(self.engine.clone(), config.token.clone());
        if let Err(e) = handshake.run(&mut reader, &mut writer).await {
            self.metrics.increment(metrics::HANDSHAKE_FAILURES_TOTAL, 1);
            *self.last_handshake_error.write().await = Some(e.to_string());
            writer.shutdown().await;
            return Err(e.into());
        }
        *self.last_handshake_error.write().await = None;

        if self.cancel.is_cancelled() {
            writer.shutdown().await;
            return Err(ClientError::ShutDown);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(Session::new(
            generation,
            info,
            writer,
            self.cancel.child_token(),
        ));
        *self.session.write().await = Some(session.clone());
        session.start(reader, self.link());

        *self.last_error.write().await = None;
        self.metrics.increment(metrics::CONNECTIONS_TOTAL, 1);
        self.status.send_replace(ConnectionStatus::Connected);
        info!("Session {} established", generation);

        // tunnels registered on an earlier session are unknown to this one
        if !self.registry.is_empty().await {
            self.readvertise().await;
        }
        Ok(generation)
    }

    fn link(&self) -> SessionLink {
        SessionLink {
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            events: self.events.clone(),
            deaths: self.deaths.clone(),
            heartbeat: self.heartbeat.clone(),
        }
    }

    async fn publish_active_tunnels(&self) {
        let active = self.registry.count_with_status(TunnelStatus::Active).await;
        self.metrics.gauge(metrics::TUNNELS_ACTIVE, active as i64);
    }

    async fn fail(&self, reason: String) {
        error!("Giving up on the relay: {}", reason);
        self.status.send_replace(ConnectionStatus::Error);
        *self.last_error.write().await = Some(reason.clone());
        let _ = self.events.send(ClientEvent::ReconnectFailed { reason });
    }

    /// Tear down the dead session and run one reconnection episode
    async fn recover(&self, death: SessionDeath) {
        let dead = {
            let mut current = self.session.write().await;
            if current.as_ref().map(|s| s.generation()) != Some(death.generation) {
                debug!("Ignoring death of superseded session {}", death.generation);
                return;
            }
            current.take()
        };
        if let Some(session) = dead {
            session.close().await;
        }

        self.status.send_replace(ConnectionStatus::Disconnected);
        *self.last_error.write().await = Some(death.reason.clone());
        let _ = self.events.send(ClientEvent::Disconnected {
            reason: death.reason,
        });

        let mut backoff = ReconnectManager::new(self.config.reconnect.clone());
        loop {
            match backoff.wait(&self.cancel).await {
                Ok(()) => {}
                Err(ReconnectError::Cancelled) => return,
                Err(e) => return self.fail(e.to_string()).await,
            }

            let attempt = backoff.attempt();
            info!("Reconnection attempt {}", attempt);
            self.metrics.increment(metrics::RECONNECT_ATTEMPTS_TOTAL, 1);
            let _ = self.events.send(ClientEvent::Reconnecting { attempt });

            let result = {
                let _guard = self.handshake_lock.lock().await;
                if *self.status.borrow() == ConnectionStatus::Connected {
                    debug!("Connection restored elsewhere");
                    return;
                }
                self.status.send_replace(ConnectionStatus::Reconnecting);
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    result = self.establish() => result,
                }
            };

            match result {
                Ok(generation) => {
                    self.metrics.increment(metrics::RECONNECTS_TOTAL, 1);
                    let _ = self.events.send(ClientEvent::Reconnected { generation });
                    return;
                }
                Err(e) if e.is_non_recoverable() => {
                    return self.fail(e.to_string()).await;
                }
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", attempt, e);
                    *self.last_error.write().await = Some(e.to_string());
                    self.status.send_replace(ConnectionStatus::Disconnected);
                }
            }
        }
    }

    /// Re-advertise every registered tunnel on the new session
    async fn readvertise(&self) {
        let Some(session) = self.session.read().await.clone() else {
            return;
        };

        let tunnels = self.registry.mark_all_stale().await;
        self.publish_active_tunnels().await;

        for tunnel in tunnels {
            if let Err(e) = session
                .send(&Envelope::TunnelInfo(tunnel.info(TunnelAction::Open)))
                .await
            {
                warn!("Failed to re-advertise tunnel {}: {}", tunnel.id, e);
                return;
            }
            debug!("Re-advertised tunnel {}", tunnel.id);
        }
    }
}

/// Receives session deaths for the lifetime of the client
async fn supervise(
    shared: Weak<Shared>,
    mut deaths: mpsc::UnboundedReceiver<SessionDeath>,
    cancel: CancellationToken,
) {
    loop {
        let death = tokio::select! {
            _ = cancel.cancelled() => break,
            death = deaths.recv() => match death {
                Some(death) => death,
                None => break,
            },
        };

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if death.generation != shared.generation.load(Ordering::SeqCst) {
            debug!("Ignoring stale death of session {}", death.generation);
            continue;
        }
        shared.recover(death).await;
    }
    debug!("Reconnection supervisor stopped");
}
