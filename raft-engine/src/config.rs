//! Runtime configuration for a [`crate::Raft`] instance.
//!
//! `Config`/`ConfigBuilder` split: sane defaults, a builder that validates
//! before handing back a usable `Config`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election_timeout_min ({min_ms}ms) must be less than election_timeout_max ({max_ms}ms)")]
    TimeoutRange { min_ms: u64, max_ms: u64 },
    #[error("heartbeat_interval must be non-zero")]
    ZeroHeartbeat,
}

/// Tuning knobs for the election timer, heartbeat loop and commit monitor.
#[derive(Debug, Clone)]
pub struct Config {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub commit_monitor_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_secs(2),
            election_timeout_max: Duration::from_secs(4),
            heartbeat_interval: Duration::from_millis(500),
            commit_monitor_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    inner: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self { inner: Config::default() }
    }
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, d: Duration) -> Self {
        self.inner.election_timeout_min = d;
        self
    }

    pub fn election_timeout_max(mut self, d: Duration) -> Self {
        self.inner.election_timeout_max = d;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.inner.heartbeat_interval = d;
        self
    }

    pub fn commit_monitor_interval(mut self, d: Duration) -> Self {
        self.inner.commit_monitor_interval = d;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let c = self.inner;
        if c.election_timeout_min >= c.election_timeout_max {
            return Err(ConfigError::TimeoutRange {
                min_ms: c.election_timeout_min.as_millis() as u64,
                max_ms: c.election_timeout_max.as_millis() as u64,
            });
        }
        if c.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        Ok(c)
    }
}
