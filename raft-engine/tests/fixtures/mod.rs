//! Shared test fixtures: an in-memory `RaftNetwork` that routes RPCs
//! directly between in-process `Raft` handles, so the test suite can drive
//! full elections and replication without touching a real socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raft_engine::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyCallback, Config, NodeId, Raft, RaftNetwork,
    RequestVoteRequest, RequestVoteResponse,
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TestCommand(pub u64);

pub struct TestNetwork {
    nodes: Mutex<HashMap<NodeId, Raft<TestCommand, TestNetwork>>>,
}

impl TestNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { nodes: Mutex::new(HashMap::new()) })
    }

    pub async fn register(&self, id: NodeId, raft: Raft<TestCommand, TestNetwork>) {
        self.nodes.lock().await.insert(id, raft);
    }
}

#[async_trait]
impl RaftNetwork<TestCommand> for TestNetwork {
    async fn request_vote(&self, target: &NodeId, req: RequestVoteRequest) -> anyhow::Result<RequestVoteResponse> {
        let nodes = self.nodes.lock().await;
        let target = nodes.get(target).ok_or_else(|| anyhow::anyhow!("unknown peer {target}"))?.clone();
        drop(nodes);
        Ok(target.on_request_vote(req).await)
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest<TestCommand>,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let nodes = self.nodes.lock().await;
        let target = nodes.get(target).ok_or_else(|| anyhow::anyhow!("unknown peer {target}"))?.clone();
        drop(nodes);
        Ok(target.on_append_entries(req).await)
    }
}

pub struct RecordingApply {
    pub applied: Arc<Mutex<Vec<TestCommand>>>,
}

impl RecordingApply {
    pub fn new() -> Self {
        Self { applied: Arc::new(Mutex::new(Vec::new())) }
    }
}

#[async_trait]
impl ApplyCallback<TestCommand> for RecordingApply {
    async fn apply(&self, command: TestCommand) {
        self.applied.lock().await.push(command);
    }
}

/// Fast timeouts suitable for tests (real defaults are seconds, which would
/// make the suite glacial).
pub fn test_config() -> Config {
    Config::builder()
        .election_timeout_min(Duration::from_millis(100))
        .election_timeout_max(Duration::from_millis(200))
        .heartbeat_interval(Duration::from_millis(30))
        .commit_monitor_interval(Duration::from_millis(10))
        .build()
        .unwrap()
}

/// Build an `n`-node cluster sharing one `TestNetwork`, with apply
/// callbacks registered but election timers **not** yet armed (call
/// `.activate()` on each returned handle, typically staggered).
pub async fn build_cluster(n: usize) -> (Vec<Raft<TestCommand, TestNetwork>>, Vec<Arc<Mutex<Vec<TestCommand>>>>) {
    let network = TestNetwork::new();
    let ids: Vec<NodeId> = (0..n).map(|i| format!("n{i}")).collect();
    let mut rafts = Vec::new();
    let mut logs = Vec::new();

    for id in &ids {
        let peers = ids.iter().filter(|p| *p != id).cloned().collect();
        let raft = Raft::new(id.clone(), peers, test_config(), network.clone());
        let applier = RecordingApply::new();
        let applied = applier.applied.clone();
        raft.register_apply_callback(Arc::new(applier)).await;
        network.register(id.clone(), raft.clone()).await;
        rafts.push(raft);
        logs.push(applied);
    }

    (rafts, logs)
}
