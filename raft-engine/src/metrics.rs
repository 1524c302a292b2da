//! Observable Raft state, published over a `watch` channel so callers (the
//! HTTP façade, tests) can either poll the latest snapshot or await changes
//! without locking the engine's internal state.

use tokio::sync::watch;

use crate::types::{NodeId, Role, Term};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
        }
    }
}

/// Create a linked `(Sender, Receiver)` pair seeded with the initial state
/// of a pristine node.
pub fn channel(id: NodeId) -> (watch::Sender<RaftMetrics>, watch::Receiver<RaftMetrics>) {
    watch::channel(RaftMetrics::new_initial(id))
}
