//! Tunnel registry
//!
//! Tunnels are keyed by a deterministic id derived from their endpoints, so
//! registering the same endpoints twice replaces the earlier entry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tunlink_proto::{TunnelAction, TunnelInfo};

/// Transport protocol carried by every tunnel
pub const TUNNEL_PROTOCOL: &str = "tcp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Local,
    Remote,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::Local => f.write_str("local"),
            PortRole::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid {role} port {port}: must be between 1 and 65535")]
    InvalidPort { role: PortRole, port: u32 },

    #[error("Invalid remote host: {0:?}")]
    InvalidHost(String),

    #[error("Tunnel not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    /// Advertised, waiting for the relay
    Pending,
    Active,
    /// Carried over a reconnection, not yet re-confirmed
    Stale,
    Failed,
}

/// Requested tunnel endpoints, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_port: u32,
    pub remote_host: String,
    pub remote_port: u32,
    pub options: BTreeMap<String, String>,
}

impl TunnelSpec {
    pub fn new(local_port: u32, remote_host: impl Into<String>, remote_port: u32) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Deterministic tunnel id.
///
/// Ports are digits only, so the first and last `-` after the prefix delimit
/// the host and distinct endpoint triples never share an id.
pub fn tunnel_id(local_port: u16, remote_host: &str, remote_port: u16) -> String {
    format!("tunnel-{}-{}-{}", local_port, remote_host, remote_port)
}

pub fn validate_port(role: PortRole, port: u32) -> Result<u16, RegistryError> {
    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(RegistryError::InvalidPort { role, port }),
    }
}

fn validate_host(host: &str) -> Result<(), RegistryError> {
    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(RegistryError::InvalidHost(host.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct Tunnel {
    pub id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub protocol: String,
    pub options: BTreeMap<String, String>,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    lifecycle: CancellationToken,
}

impl Tunnel {
    pub fn from_spec(spec: TunnelSpec) -> Result<Self, RegistryError> {
        let local_port = validate_port(PortRole::Local, spec.local_port)?;
        let remote_port = validate_port(PortRole::Remote, spec.remote_port)?;
        validate_host(&spec.remote_host)?;

        Ok(Self {
            id: tunnel_id(local_port, &spec.remote_host, remote_port),
            local_port,
            remote_host: spec.remote_host,
            remote_port,
            protocol: TUNNEL_PROTOCOL.to_string(),
            options: spec.options,
            status: TunnelStatus::Pending,
            created_at: Utc::now(),
            lifecycle: CancellationToken::new(),
        })
    }

    /// Cancelled once the tunnel is closed or replaced
    pub fn lifecycle(&self) -> CancellationToken {
        self.lifecycle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    /// The `tunnel_info` advertisement for this tunnel
    pub fn info(&self, action: TunnelAction) -> TunnelInfo {
        TunnelInfo {
            tunnel_id: self.id.clone(),
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            protocol: self.protocol.clone(),
            options: self.options.clone(),
            action,
        }
    }
}

#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel, replacing (and closing) any tunnel with the same id
    pub async fn insert(&self, tunnel: Tunnel) -> Option<Tunnel> {
        let replaced = self.swap(tunnel).await;
        if let Some(old) = &replaced {
            old.lifecycle.cancel();
        }
        replaced
    }

    /// Register a tunnel and hand back the one it displaced, still open.
    /// Pair with [`TunnelRegistry::revert`] when the registration falls through.
    pub async fn swap(&self, tunnel: Tunnel) -> Option<Tunnel> {
        let id = tunnel.id.clone();
        let replaced = self.tunnels.write().await.insert(id.clone(), tunnel);
        match &replaced {
            Some(_) => debug!("Replaced tunnel {}", id),
            None => info!("Registered tunnel {}", id),
        }
        replaced
    }

    /// Undo a [`TunnelRegistry::swap`]: put `previous` back, or drop `id` when
    /// there was nothing before. The tunnel being undone is closed.
    pub async fn revert(&self, id: &str, previous: Option<Tunnel>) {
        let mut tunnels = self.tunnels.write().await;
        let undone = match previous {
            Some(previous) => tunnels.insert(id.to_string(), previous),
            None => tunnels.remove(id),
        };
        if let Some(undone) = undone {
            undone.lifecycle.cancel();
            debug!("Reverted registration of tunnel {}", id);
        }
    }

    pub async fn remove(&self, id: &str) -> Result<Tunnel, RegistryError> {
        let tunnel = self
            .tunnels
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        tunnel.lifecycle.cancel();
        info!("Removed tunnel {}", id);
        Ok(tunnel)
    }

    pub async fn get(&self, id: &str) -> Option<Tunnel> {
        self.tunnels.read().await.get(id).cloned()
    }

    /// All tunnels, oldest first
    pub async fn list(&self) -> Vec<Tunnel> {
        let mut tunnels: Vec<Tunnel> = self.tunnels.read().await.values().cloned().collect();
        tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tunnels
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }

    pub async fn count_with_status(&self, status: TunnelStatus) -> usize {
        self.tunnels
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    pub async fn set_status(&self, id: &str, status: TunnelStatus) -> Result<(), RegistryError> {
        let mut tunnels = self.tunnels.write().await;
        let tunnel = tunnels
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        debug!("Tunnel {}: {:?} -> {:?}", id, tunnel.status, status);
        tunnel.status = status;
        Ok(())
    }

    /// Mark every tunnel stale and return them for re-advertisement
    pub async fn mark_all_stale(&self) -> Vec<Tunnel> {
        let mut tunnels = self.tunnels.write().await;
        for tunnel in tunnels.values_mut() {
            tunnel.status = TunnelStatus::Stale;
        }
        let mut stale: Vec<Tunnel> = tunnels.values().cloned().collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        stale
    }

    /// Close and drop every tunnel, returning how many there were
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Tunnel> = self.tunnels.write().await.drain().map(|(_, t)| t).collect();
        for tunnel in &drained {
            tunnel.lifecycle.cancel();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel(local: u32, host: &str, remote: u32) -> Tunnel {
        Tunnel::from_spec(TunnelSpec::new(local, host, remote)).unwrap()
    }

    #[test]
    fn test_tunnel_id_format() {
        assert_eq!(
            tunnel_id(3389, "internal-host", 3389),
            "tunnel-3389-internal-host-3389"
        );
    }

    #[test]
    fn test_tunnel_id_is_injective_for_dashed_hosts() {
        assert_ne!(tunnel_id(1, "2-a", 3), tunnel_id(12, "a", 3));
        assert_ne!(tunnel_id(1, "a-2", 3), tunnel_id(1, "a", 23));
        assert_ne!(tunnel_id(1, "a", 2), tunnel_id(1, "a-", 2));
    }

    #[test]
    fn test_port_validation() {
        assert_eq!(validate_port(PortRole::Local, 1), Ok(1));
        assert_eq!(validate_port(PortRole::Remote, 65535), Ok(65535));
        assert_eq!(
            validate_port(PortRole::Local, 0),
            Err(RegistryError::InvalidPort {
                role: PortRole::Local,
                port: 0
            })
        );
        assert_eq!(
            validate_port(PortRole::Remote, 65536),
            Err(RegistryError::InvalidPort {
                role: PortRole::Remote,
                port: 65536
            })
        );
    }

    #[test]
    fn test_from_spec_validates_everything() {
        assert!(matches!(
            Tunnel::from_spec(TunnelSpec::new(70000, "h", 1)),
            Err(RegistryError::InvalidPort {
                role: PortRole::Local,
                ..
            })
        ));
        assert!(matches!(
            Tunnel::from_spec(TunnelSpec::new(1, "", 1)),
            Err(RegistryError::InvalidHost(_))
        ));
        assert!(matches!(
            Tunnel::from_spec(TunnelSpec::new(1, "bad host", 1)),
            Err(RegistryError::InvalidHost(_))
        ));

        let t = tunnel(3389, "internal-host", 3389);
        assert_eq!(t.status, TunnelStatus::Pending);
        assert_eq!(t.protocol, "tcp");
        assert!(!t.is_closed());
    }

    #[test]
    fn test_info_carries_options_and_action() {
        let t = Tunnel::from_spec(TunnelSpec::new(22, "db", 2222).with_option("mode", "ssh"))
            .unwrap();
        let info = t.info(TunnelAction::Close);
        assert_eq!(info.tunnel_id, "tunnel-22-db-2222");
        assert_eq!(info.options.get("mode").map(String::as_str), Some("ssh"));
        assert_eq!(info.action, TunnelAction::Close);
    }

    #[tokio::test]
    async fn test_insert_same_id_replaces_and_closes_old() {
        let registry = TunnelRegistry::new();
        let first = tunnel(80, "web", 8080);
        let first_lifecycle = first.lifecycle();

        assert!(registry.insert(first).await.is_none());
        assert!(registry.insert(tunnel(80, "web", 8080)).await.is_some());

        assert_eq!(registry.len().await, 1);
        assert!(first_lifecycle.is_cancelled());
        assert!(!registry.get("tunnel-80-web-8080").await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_revert_restores_displaced_tunnel() {
        let registry = TunnelRegistry::new();
        let original = tunnel(80, "web", 8080);
        let original_lifecycle = original.lifecycle();
        registry.insert(original).await;
        registry
            .set_status("tunnel-80-web-8080", TunnelStatus::Active)
            .await
            .unwrap();

        let replacement = tunnel(80, "web", 8080);
        let replacement_lifecycle = replacement.lifecycle();
        let previous = registry.swap(replacement).await;
        assert!(!original_lifecycle.is_cancelled());

        registry.revert("tunnel-80-web-8080", previous).await;

        let restored = registry.get("tunnel-80-web-8080").await.unwrap();
        assert_eq!(restored.status, TunnelStatus::Active);
        assert!(!restored.is_closed());
        assert!(replacement_lifecycle.is_cancelled());
    }

    #[tokio::test]
    async fn test_revert_without_previous_drops_id() {
        let registry = TunnelRegistry::new();
        let t = tunnel(80, "web", 8080);
        let lifecycle = t.lifecycle();

        let previous = registry.swap(t).await;
        assert!(previous.is_none());
        registry.revert("tunnel-80-web-8080", previous).await;

        assert!(registry.is_empty().await);
        assert!(lifecycle.is_cancelled());
    }

    #[tokio::test]
    async fn test_remove_cancels_lifecycle() {
        let registry = TunnelRegistry::new();
        let t = tunnel(80, "web", 8080);
        let lifecycle = t.lifecycle();
        registry.insert(t).await;

        let removed = registry.remove("tunnel-80-web-8080").await.unwrap();
        assert!(removed.is_closed());
        assert!(lifecycle.is_cancelled());
        assert!(registry.is_empty().await);

        assert_eq!(
            registry.remove("tunnel-80-web-8080").await.unwrap_err(),
            RegistryError::NotFound("tunnel-80-web-8080".to_string())
        );
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let registry = TunnelRegistry::new();
        registry.insert(tunnel(1, "a", 2)).await;
        registry.insert(tunnel(3, "b", 4)).await;

        registry
            .set_status("tunnel-1-a-2", TunnelStatus::Active)
            .await
            .unwrap();
        assert_eq!(registry.count_with_status(TunnelStatus::Active).await, 1);

        let stale = registry.mark_all_stale().await;
        assert_eq!(stale.len(), 2);
        assert!(stale.iter().all(|t| t.status == TunnelStatus::Stale));
        assert_eq!(registry.count_with_status(TunnelStatus::Active).await, 0);

        assert!(registry
            .set_status("missing", TunnelStatus::Failed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = TunnelRegistry::new();
        let t = tunnel(1, "a", 2);
        let lifecycle = t.lifecycle();
        registry.insert(t).await;
        registry.insert(tunnel(3, "b", 4)).await;

        assert_eq!(registry.close_all().await, 2);
        assert!(registry.is_empty().await);
        assert!(lifecycle.is_cancelled());
        assert!(registry.list().await.is_empty());
    }
}
