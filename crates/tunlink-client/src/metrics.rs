//! Metrics emission
//!
//! The client only emits named counters and gauges. Exporting them is left
//! to whoever implements [`MetricsSink`].

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Mutex;

pub const CONNECTIONS_TOTAL: &str = "tunlink_connections_total";
pub const HANDSHAKE_FAILURES_TOTAL: &str = "tunlink_handshake_failures_total";
pub const HEARTBEATS_SENT_TOTAL: &str = "tunlink_heartbeats_sent_total";
pub const HEARTBEATS_MISSED_TOTAL: &str = "tunlink_heartbeats_missed_total";
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "tunlink_reconnect_attempts_total";
pub const RECONNECTS_TOTAL: &str = "tunlink_reconnects_total";
pub const SERVER_ERRORS_TOTAL: &str = "tunlink_server_errors_total";
pub const TUNNELS_ACTIVE: &str = "tunlink_tunnels_active";

pub trait MetricsSink: Send + Sync + Debug {
    fn increment(&self, name: &'static str, value: u64);

    fn gauge(&self, name: &'static str, value: i64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _value: u64) {}

    fn gauge(&self, _name: &'static str, _value: i64) {}
}

/// Point-in-time copy of [`InMemoryMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct Values {
    counters: HashMap<&'static str, u64>,
    gauges: HashMap<&'static str, i64>,
}

/// Keeps every metric in memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    values: Mutex<Values>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, Values> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.values().counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        self.values().gauges.get(name).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let values = self.values();
        MetricsSnapshot {
            counters: values
                .counters
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            gauges: values
                .gauges
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &'static str, value: u64) {
        *self.values().counters.entry(name).or_insert(0) += value;
    }

    fn gauge(&self, name: &'static str, value: i64) {
        self.values().gauges.insert(name, value);
    }
}
