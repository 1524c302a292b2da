//! PBFT (Practical Byzantine Fault Tolerance) consensus engine.
//!
//! Three-phase (pre-prepare/prepare/commit) agreement over client requests,
//! independent of the Raft engine used for lock replication.

mod digest;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use raft_engine::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::NodeConfig;
use crate::transport::HttpPeerTransport;

/// Errors this engine can produce on its own, independent of any HTTP
/// framing. The façade (`crate::error::ApiError`) converts these at the
/// boundary; this type carries no status-code knowledge.
#[derive(Debug, Error)]
pub enum PbftError {
    #[error("unknown simulated behavior type: {0}")]
    UnknownBehavior(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    PrePrepare,
    Prepare,
    Commit,
}

impl MessageType {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "pre-prepare" => Some(MessageType::PrePrepare),
            "prepare" => Some(MessageType::Prepare),
            "commit" => Some(MessageType::Commit),
            _ => None,
        }
    }

    fn as_wire(self) -> &'static str {
        match self {
            MessageType::PrePrepare => "pre-prepare",
            MessageType::Prepare => "prepare",
            MessageType::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbftMessage {
    pub msg_type: MessageType,
    pub view: u64,
    pub sequence: u64,
    pub digest: String,
    pub node_id: NodeId,
    pub timestamp: f64,
    #[serde(default)]
    pub request: Option<Value>,
    #[serde(default)]
    pub signature: Option<String>,
}

impl PbftMessage {
    fn new(msg_type: MessageType, view: u64, sequence: u64, digest: String, node_id: NodeId) -> Self {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
        Self { msg_type, view, sequence, digest, node_id, timestamp, request: None, signature: None }
    }

    fn signed(mut self) -> Self {
        self.signature = Some(digest::sign_message(
            self.msg_type.as_wire(),
            self.view,
            self.sequence,
            &self.digest,
            &self.node_id,
        ));
        self
    }

    fn verify(&self) -> bool {
        match &self.signature {
            Some(sig) => digest::verify_signature(self.msg_type.as_wire(), self.view, self.sequence, &self.digest, &self.node_id, sig),
            None => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PbftStatus {
    pub view: u64,
    pub sequence: u64,
    pub primary: NodeId,
    pub is_primary: bool,
    pub f: u32,
    pub quorum_size: u32,
    pub last_executed: u64,
    pub executed_count: usize,
    pub byzantine_nodes: Vec<NodeId>,
    pub suspicious_nodes: HashMap<NodeId, u32>,
}

pub enum ClientRequestOutcome {
    Started { sequence: u64, digest: String },
    Forwarded { primary: NodeId },
}

struct State {
    view: u64,
    sequence: u64,
    pre_prepare_log: HashMap<u64, PbftMessage>,
    prepare_log: HashMap<u64, Vec<PbftMessage>>,
    commit_log: HashMap<u64, Vec<PbftMessage>>,
    executed: HashSet<u64>,
    last_executed: u64,
    suspicion_count: HashMap<NodeId, u32>,
}

fn hostname_of(url: &str) -> String {
    url.splitn(2, "//").nth(1).and_then(|rest| rest.split(':').next()).unwrap_or(url).to_string()
}

/// `sorted(hostname for url in all_nodes)[view % n]`. Operators are
/// expected to set `NODE_ID` to the hostname portion of their own entry in
/// `ALL_NODES` (the same convention the orchestrator's leader-forwarding
/// relies on).
fn primary_at(all_nodes: &[String], view: u64) -> NodeId {
    let mut hosts: Vec<String> = all_nodes.iter().map(|u| hostname_of(u)).collect();
    hosts.sort();
    hosts[(view as usize) % hosts.len()].clone()
}

pub struct PbftEngine {
    id: NodeId,
    all_nodes: Vec<String>,
    peers: Vec<String>,
    f: u32,
    quorum_size: u32,
    byzantine_threshold: u32,
    transport: Arc<HttpPeerTransport>,
    state: Mutex<State>,
}

impl PbftEngine {
    pub fn new(config: &NodeConfig, transport: Arc<HttpPeerTransport>) -> Self {
        let n = config.all_nodes.len().max(1) as u32;
        let f = (n.saturating_sub(1)) / 3;
        let quorum_size = 2 * f + 1;
        tracing::info!(n, f, quorum_size, "pbft engine initialized");
        Self {
            id: config.node_id.clone(),
            all_nodes: config.all_nodes.clone(),
            peers: config.peers.clone(),
            f,
            quorum_size,
            byzantine_threshold: config.pbft_byzantine_threshold,
            transport,
            state: Mutex::new(State {
                view: 0,
                sequence: 0,
                pre_prepare_log: HashMap::new(),
                prepare_log: HashMap::new(),
                commit_log: HashMap::new(),
                executed: HashSet::new(),
                last_executed: 0,
                suspicion_count: HashMap::new(),
            }),
        }
    }

    pub async fn primary_id(&self) -> NodeId {
        let view = self.state.lock().await.view;
        primary_at(&self.all_nodes, view)
    }

    pub async fn is_primary(&self) -> bool {
        self.primary_id().await == self.id
    }

    pub async fn status(&self) -> PbftStatus {
        let st = self.state.lock().await;
        let byzantine_nodes = st
            .suspicion_count
            .iter()
            .filter(|(_, &count)| count >= self.byzantine_threshold)
            .map(|(n, _)| n.clone())
            .collect();
        PbftStatus {
            view: st.view,
            sequence: st.sequence,
            primary: primary_at(&self.all_nodes, st.view),
            is_primary: primary_at(&self.all_nodes, st.view) == self.id,
            f: self.f,
            quorum_size: self.quorum_size,
            last_executed: st.last_executed,
            executed_count: st.executed.len(),
            byzantine_nodes,
            suspicious_nodes: st.suspicion_count.clone(),
        }
    }

    fn detect_byzantine_locked(&self, st: &mut State, node_id: &NodeId, reason: &str) -> bool {
        let count = st.suspicion_count.entry(node_id.clone()).or_insert(0);
        *count += 1;
        tracing::warn!(%node_id, reason, count = *count, "suspicious pbft behavior");
        if *count >= self.byzantine_threshold {
            tracing::warn!(%node_id, "node marked byzantine");
            true
        } else {
            false
        }
    }

    async fn is_byzantine(&self, node_id: &NodeId) -> bool {
        let st = self.state.lock().await;
        st.suspicion_count.get(node_id).copied().unwrap_or(0) >= self.byzantine_threshold
    }

    pub async fn handle_client_request(&self, request: Value) -> ClientRequestOutcome {
        if self.is_primary().await {
            let (sequence, digest) = self.start_consensus(request).await;
            ClientRequestOutcome::Started { sequence, digest }
        } else {
            ClientRequestOutcome::Forwarded { primary: self.primary_id().await }
        }
    }

    async fn start_consensus(&self, request: Value) -> (u64, String) {
        let digest = digest::compute_digest(&request);
        let (view, sequence, pre_prepare) = {
            let mut st = self.state.lock().await;
            st.sequence += 1;
            let sequence = st.sequence;
            let view = st.view;
            let mut msg = PbftMessage::new(MessageType::PrePrepare, view, sequence, digest.clone(), self.id.clone());
            msg.request = Some(request);
            let msg = msg.signed();
            st.pre_prepare_log.insert(sequence, msg.clone());
            (view, sequence, msg)
        };
        tracing::info!(%view, sequence, "pbft primary broadcasting pre-prepare");
        self.transport.broadcast_pbft(&self.peers, &pre_prepare).await;
        self.handle_pre_prepare(pre_prepare).await;
        (sequence, digest)
    }

    pub async fn on_protocol_message(&self, message: PbftMessage) {
        match message.msg_type {
            MessageType::PrePrepare => self.handle_pre_prepare(message).await,
            MessageType::Prepare => self.handle_prepare(message).await,
            MessageType::Commit => self.handle_commit(message).await,
        }
    }

    async fn handle_pre_prepare(&self, message: PbftMessage) {
        let primary = self.primary_id().await;
        let prepare = {
            let mut st = self.state.lock().await;
            if message.node_id != primary {
                self.detect_byzantine_locked(&mut st, &message.node_id, "non-primary sent pre-prepare");
                return;
            }
            if !message.verify() {
                self.detect_byzantine_locked(&mut st, &message.node_id, "invalid pre-prepare signature");
                return;
            }
            if let Some(existing) = st.pre_prepare_log.get(&message.sequence) {
                if existing.digest != message.digest {
                    self.detect_byzantine_locked(&mut st, &message.node_id, "conflicting pre-prepare");
                    return;
                }
            }
            st.pre_prepare_log.insert(message.sequence, message.clone());
            tracing::debug!(sequence = message.sequence, from = %message.node_id, "received pre-prepare");

            let prepare = PbftMessage::new(MessageType::Prepare, st.view, message.sequence, message.digest.clone(), self.id.clone()).signed();
            st.prepare_log.entry(message.sequence).or_default().push(prepare.clone());
            prepare
        };
        self.transport.broadcast_pbft(&self.peers, &prepare).await;
        self.check_prepare_quorum(message.sequence).await;
    }

    async fn handle_prepare(&self, message: PbftMessage) {
        {
            let mut st = self.state.lock().await;
            if !message.verify() {
                self.detect_byzantine_locked(&mut st, &message.node_id, "invalid prepare signature");
                return;
            }
        }
        if self.is_byzantine(&message.node_id).await {
            return;
        }
        {
            let mut st = self.state.lock().await;
            let Some(pre_prepare) = st.pre_prepare_log.get(&message.sequence).cloned() else {
                return; // prepare arrived before pre-prepare; ignore
            };
            if message.digest != pre_prepare.digest {
                self.detect_byzantine_locked(&mut st, &message.node_id, "prepare digest mismatch");
                return;
            }
            let prepares = st.prepare_log.entry(message.sequence).or_default();
            if prepares.iter().any(|p| p.node_id == message.node_id) {
                return;
            }
            prepares.push(message.clone());
            tracing::debug!(sequence = message.sequence, from = %message.node_id, count = prepares.len(), "received prepare");
        }
        self.check_prepare_quorum(message.sequence).await;
    }

    async fn check_prepare_quorum(&self, sequence: u64) {
        let commit = {
            let mut st = self.state.lock().await;
            let Some(prepares) = st.prepare_log.get(&sequence) else { return };
            if (prepares.len() as u32) < self.quorum_size {
                return;
            }
            if st.commit_log.get(&sequence).map(|c| c.iter().any(|m| m.node_id == self.id)).unwrap_or(false) {
                return; // already sent our own commit for this sequence
            }
            let Some(pre_prepare) = st.pre_prepare_log.get(&sequence).cloned() else { return };
            tracing::info!(sequence, "prepare quorum reached");
            let commit = PbftMessage::new(MessageType::Commit, st.view, sequence, pre_prepare.digest, self.id.clone()).signed();
            st.commit_log.entry(sequence).or_default().push(commit.clone());
            commit
        };
        self.transport.broadcast_pbft(&self.peers, &commit).await;
        self.check_commit_quorum(sequence).await;
    }

    async fn handle_commit(&self, message: PbftMessage) {
        {
            let mut st = self.state.lock().await;
            if !message.verify() {
                self.detect_byzantine_locked(&mut st, &message.node_id, "invalid commit signature");
                return;
            }
        }
        if self.is_byzantine(&message.node_id).await {
            return;
        }
        {
            let mut st = self.state.lock().await;
            let commits = st.commit_log.entry(message.sequence).or_default();
            if commits.iter().any(|c| c.node_id == message.node_id) {
                return;
            }
            commits.push(message.clone());
            tracing::debug!(sequence = message.sequence, from = %message.node_id, count = commits.len(), "received commit");
        }
        self.check_commit_quorum(message.sequence).await;
    }

    async fn check_commit_quorum(&self, sequence: u64) {
        let mut st = self.state.lock().await;
        if st.executed.contains(&sequence) {
            return;
        }
        let Some(commits) = st.commit_log.get(&sequence) else { return };
        if (commits.len() as u32) < self.quorum_size {
            return;
        }
        tracing::info!(sequence, "commit quorum reached");
        self.execute_request_locked(&mut st, sequence);
    }

    fn execute_request_locked(&self, st: &mut State, sequence: u64) {
        if st.executed.contains(&sequence) {
            return;
        }
        let Some(pre_prepare) = st.pre_prepare_log.get(&sequence) else { return };
        tracing::info!(sequence, request = ?pre_prepare.request, "executing pbft request");
        st.executed.insert(sequence);
        st.last_executed = st.last_executed.max(sequence);
    }

    /// Broadcast a deliberately malformed message to exercise Byzantine
    /// detection on peers. Diagnostic-only: never touches our own logs.
    pub async fn simulate_byzantine(&self, behavior_type: &str) -> Result<&'static str, PbftError> {
        let st = self.state.lock().await;
        let (view, sequence) = (st.view, st.sequence);
        drop(st);

        let fake = match behavior_type {
            "conflicting_prepare" => {
                PbftMessage::new(MessageType::Prepare, view, sequence, "fake_digest_12345".to_string(), self.id.clone()).signed()
            }
            "invalid_signature" => {
                let mut msg = PbftMessage::new(MessageType::Prepare, view, sequence, "some_digest".to_string(), self.id.clone());
                msg.signature = Some("invalid_signature_xyz".to_string());
                msg
            }
            other => return Err(PbftError::UnknownBehavior(other.to_string())),
        };
        self.transport.broadcast_pbft(&self.peers, &fake).await;
        Ok(match behavior_type {
            "conflicting_prepare" => "sent conflicting prepare message",
            _ => "sent message with invalid signature",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(node_id: &str, all_nodes: Vec<&str>) -> NodeConfig {
        let all_nodes: Vec<String> = all_nodes.into_iter().map(String::from).collect();
        NodeConfig {
            port: 8000,
            node_id: node_id.to_string(),
            all_nodes,
            peers: Vec::new(),
            redis_host: "redis".into(),
            redis_port: 6379,
            raft: raft_engine::Config::default(),
            pbft_byzantine_threshold: 3,
            rpc_deadline: std::time::Duration::from_secs(1),
            broadcast_deadline: std::time::Duration::from_millis(200),
            settling_delay: std::time::Duration::from_millis(1),
        }
    }

    fn transport() -> Arc<HttpPeerTransport> {
        Arc::new(HttpPeerTransport::new(std::time::Duration::from_secs(1), std::time::Duration::from_millis(200)))
    }

    #[test]
    fn primary_is_first_sorted_hostname_at_view_zero() {
        let all_nodes = vec!["http://a:8000".to_string(), "http://c:8000".to_string(), "http://b:8000".to_string()];
        assert_eq!(primary_at(&all_nodes, 0), "a");
        assert_eq!(primary_at(&all_nodes, 1), "b");
    }

    #[tokio::test]
    async fn four_node_cluster_has_f_one_quorum_three() {
        let config = cfg("a", vec!["http://a:8000", "http://b:8000", "http://c:8000", "http://d:8000"]);
        let engine = PbftEngine::new(&config, transport());
        assert_eq!(engine.f, 1);
        assert_eq!(engine.quorum_size, 3);
        assert!(engine.is_primary().await);
    }

    #[tokio::test]
    async fn pre_prepare_from_non_primary_is_flagged_suspicious() {
        let config = cfg("b", vec!["http://a:8000", "http://b:8000", "http://c:8000", "http://d:8000"]);
        let engine = PbftEngine::new(&config, transport());
        let bogus = PbftMessage::new(MessageType::PrePrepare, 0, 1, "d".to_string(), "c".to_string()).signed();
        engine.handle_pre_prepare(bogus).await;
        let status = engine.status().await;
        assert_eq!(status.suspicious_nodes.get("c"), Some(&1));
    }

    #[tokio::test]
    async fn repeated_bad_behavior_marks_node_byzantine() {
        let config = cfg("b", vec!["http://a:8000", "http://b:8000", "http://c:8000", "http://d:8000"]);
        let engine = PbftEngine::new(&config, transport());
        for i in 0..3 {
            let bogus = PbftMessage::new(MessageType::PrePrepare, 0, i, "x".to_string(), "c".to_string()).signed();
            engine.handle_pre_prepare(bogus).await;
        }
        assert!(engine.is_byzantine(&"c".to_string()).await);
    }
}
