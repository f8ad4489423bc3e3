//! Reconnection pacing with exponential backoff

use crate::duration_secs;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first attempt
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    /// Upper bound on the delay
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Attempts per failure episode (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached ({0})")]
    MaxAttemptsReached(usize),

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Tracks attempts and backoff for one failure episode
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep before the next attempt.
    ///
    /// Fails without sleeping once the attempt budget is spent, and returns
    /// early with [`ReconnectError::Cancelled`] when `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt >= max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }
        self.attempt += 1;

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current_backoff, self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = sleep(self.current_backoff) => {}
        }

        let scaled = self.current_backoff.as_secs_f64() * self.config.multiplier;
        let next_backoff = Duration::try_from_secs_f64(scaled).unwrap_or(self.config.max_backoff);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Reset after a successful reconnection
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }
}
