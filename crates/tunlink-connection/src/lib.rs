//! Connection liveness and recovery
//!
//! Heartbeat supervision detects a dead control connection; the reconnect
//! manager paces the attempts to bring it back.

pub mod heartbeat;
pub mod reconnect;

pub use heartbeat::{
    HeartbeatConfig, HeartbeatExit, HeartbeatSender, HeartbeatState, HeartbeatSupervisor,
};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

/// Serialize a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
