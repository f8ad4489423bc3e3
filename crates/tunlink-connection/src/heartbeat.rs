//! Heartbeat supervision for the control connection
//!
//! Every `interval` a heartbeat is sent and an acknowledgement is awaited for
//! up to `timeout`. A failed send or a missing acknowledgement is a miss; an
//! acknowledgement resets the count. Reaching `max_missed` ends supervision
//! with [`HeartbeatExit::Exhausted`].

use crate::duration_secs;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_missed: 3,
        }
    }
}

/// Where heartbeats go
#[async_trait]
pub trait HeartbeatSender: Send + Sync {
    async fn send_heartbeat(&self, timestamp_ms: u64) -> Result<(), String>;

    /// Called after every miss with the running count
    fn record_miss(&self, _missed: u32) {}
}

/// Liveness snapshot published to status readers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatState {
    pub last_sent: Option<DateTime<Utc>>,
    pub last_acked: Option<DateTime<Utc>>,
    pub missed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    Cancelled,
    Exhausted { missed: u32 },
}

enum Probe {
    Acked,
    Missed,
    Cancelled,
}

pub struct HeartbeatSupervisor {
    config: HeartbeatConfig,
    state: watch::Sender<HeartbeatState>,
}

impl HeartbeatSupervisor {
    pub fn new(config: HeartbeatConfig) -> Self {
        let (state, _) = watch::channel(HeartbeatState::default());
        Self { config, state }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<HeartbeatState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> HeartbeatState {
        self.state.borrow().clone()
    }

    /// Supervise until cancelled or until too many heartbeats go unanswered.
    ///
    /// `acks` carries the echoed timestamps of `heartbeat_response` messages.
    /// The first heartbeat goes out one interval after the call.
    pub async fn run<S>(
        &self,
        sender: &S,
        acks: &mut mpsc::Receiver<u64>,
        cancel: &CancellationToken,
    ) -> HeartbeatExit
    where
        S: HeartbeatSender + ?Sized,
    {
        let interval = self.config.interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0u32;
        self.state.send_modify(|s| s.missed = 0);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return HeartbeatExit::Cancelled,
                _ = ticker.tick() => {}
            }

            match self.probe(sender, acks, cancel).await {
                Probe::Cancelled => return HeartbeatExit::Cancelled,
                Probe::Acked => {
                    if missed > 0 {
                        debug!("Heartbeat acknowledged after {} missed", missed);
                    }
                    missed = 0;
                    self.state.send_modify(|s| {
                        s.last_acked = Some(Utc::now());
                        s.missed = 0;
                    });
                }
                Probe::Missed => {
                    missed += 1;
                    warn!("Heartbeat missed ({}/{})", missed, self.config.max_missed);
                    self.state.send_modify(|s| s.missed = missed);
                    sender.record_miss(missed);

                    if missed >= self.config.max_missed {
                        return HeartbeatExit::Exhausted { missed };
                    }
                }
            }
        }
    }

    async fn probe<S>(
        &self,
        sender: &S,
        acks: &mut mpsc::Receiver<u64>,
        cancel: &CancellationToken,
    ) -> Probe
    where
        S: HeartbeatSender + ?Sized,
    {
        // late acks from an earlier round do not count for this one
        while acks.try_recv().is_ok() {}

        let timestamp = Utc::now().timestamp_millis().max(0) as u64;
        let sent = tokio::select! {
            _ = cancel.cancelled() => return Probe::Cancelled,
            sent = sender.send_heartbeat(timestamp) => sent,
        };
        if let Err(e) = sent {
            warn!("Failed to send heartbeat: {}", e);
            return Probe::Missed;
        }
        self.state.send_modify(|s| s.last_sent = Some(Utc::now()));

        tokio::select! {
            _ = cancel.cancelled() => Probe::Cancelled,
            ack = tokio::time::timeout(self.config.timeout, acks.recv()) => match ack {
                Ok(Some(_)) => Probe::Acked,
                Ok(None) => {
                    debug!("Heartbeat acknowledgement channel closed");
                    Probe::Missed
                }
                Err(_) => Probe::Missed,
            },
        }
    }
}
