//! Process configuration, loaded from environment variables at startup.
//!
//! `peers` is derived by filtering `all_nodes` on port rather than full URL,
//! since comparing full URLs breaks under hostname/`127.0.0.1`/`localhost`
//! aliasing between a node and its own peer list.

use std::time::Duration;

use raft_engine::Config as RaftConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid raft tuning: {0}")]
    Raft(#[from] raft_engine::config::ConfigError),
    #[error("{0} must be a valid integer: {1}")]
    InvalidInt(String, std::num::ParseIntError),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub port: u16,
    pub node_id: String,
    pub all_nodes: Vec<String>,
    pub peers: Vec<String>,
    pub redis_host: String,
    pub redis_port: u16,
    pub raft: RaftConfig,
    pub pbft_byzantine_threshold: u32,
    pub rpc_deadline: Duration,
    pub broadcast_deadline: Duration,
    pub settling_delay: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|e| ConfigError::InvalidInt(key.to_string(), e)),
        Err(_) => Ok(default),
    }
}

fn port_of(url: &str) -> Option<u16> {
    url.rsplit(':').next()?.parse().ok()
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = env_or("PORT", "8000")
            .parse()
            .map_err(|e| ConfigError::InvalidInt("PORT".to_string(), e))?;
        let node_id = env_or("NODE_ID", "default_node");

        let all_nodes: Vec<String> = env_or("ALL_NODES", &format!("http://localhost:{port}"))
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let peers: Vec<String> = all_nodes
            .iter()
            .filter(|url| port_of(url) != Some(port))
            .cloned()
            .collect();

        let redis_host = env_or("REDIS_HOST", "redis");
        let redis_port: u16 = env_or("REDIS_PORT", "6379")
            .parse()
            .map_err(|e| ConfigError::InvalidInt("REDIS_PORT".to_string(), e))?;

        let election_min_ms = env_u64("ELECTION_TIMEOUT_MIN_MS", 2000)?;
        let election_max_ms = env_u64("ELECTION_TIMEOUT_MAX_MS", 4000)?;
        let heartbeat_ms = env_u64("HEARTBEAT_INTERVAL_MS", 500)?;
        let commit_monitor_ms = env_u64("COMMIT_MONITOR_INTERVAL_MS", 100)?;

        let raft = RaftConfig::builder()
            .election_timeout_min(Duration::from_millis(election_min_ms))
            .election_timeout_max(Duration::from_millis(election_max_ms))
            .heartbeat_interval(Duration::from_millis(heartbeat_ms))
            .commit_monitor_interval(Duration::from_millis(commit_monitor_ms))
            .build()?;

        let pbft_byzantine_threshold = env_u64("PBFT_BYZANTINE_THRESHOLD", 3)? as u32;

        Ok(Self {
            port,
            node_id,
            all_nodes,
            peers,
            redis_host,
            redis_port,
            raft,
            pbft_byzantine_threshold,
            rpc_deadline: Duration::from_secs(3),
            broadcast_deadline: Duration::from_millis(500),
            settling_delay: Duration::from_secs(3),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_are_filtered_by_port_not_url() {
        let all_nodes = vec![
            "http://127.0.0.1:8001".to_string(),
            "http://node-b:8002".to_string(),
            "http://localhost:8003".to_string(),
        ];
        let self_port = 8002u16;
        let peers: Vec<String> = all_nodes.iter().filter(|u| port_of(u) != Some(self_port)).cloned().collect();
        assert_eq!(peers, vec!["http://127.0.0.1:8001".to_string(), "http://localhost:8003".to_string()]);
    }
}
