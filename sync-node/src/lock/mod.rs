//! The replicated lock table: the Raft apply callback and the leader-side
//! admission logic (type compatibility, deadlock detection, FIFO
//! queueing) that runs before a command is ever proposed.

mod deadlock;

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use raft_engine::{ApplyCallback, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub use deadlock::WaitForGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Shared,
    Exclusive,
}

impl LockType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shared" => Some(LockType::Shared),
            "exclusive" => Some(LockType::Exclusive),
            _ => None,
        }
    }
}

/// The two command kinds the Raft log carries for this state machine.
/// This is the `C` type parameter of `raft_engine::Raft<C, N>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockCommand {
    AcquireLock { lock_name: String, lock_type: LockType, requester: NodeId },
    ReleaseLock { lock_name: String, requester: NodeId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    #[serde(rename = "type")]
    pub lock_type: LockType,
    pub owners: Vec<NodeId>,
    pub waiters: VecDeque<(NodeId, LockType)>,
}

impl LockEntry {
    fn new(lock_type: LockType) -> Self {
        Self { lock_type, owners: Vec::new(), waiters: VecDeque::new() }
    }
}

pub type LockTable = HashMap<String, LockEntry>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("deadlock detected")]
    Deadlock,
    #[error("lock busy")]
    Busy { owners: Vec<NodeId> },
    #[error("failed to replicate log entry")]
    ReplicationFailed,
}

struct State {
    table: LockTable,
    graph: WaitForGraph,
}

/// The replicated lock table plus the leader-local wait-for graph. Both are
/// guarded by one mutex, since admission reads both together and the apply
/// path must never race a concurrent admission decision.
pub struct LockStateMachine {
    state: Mutex<State>,
}

impl Default for LockStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStateMachine {
    pub fn new() -> Self {
        Self { state: Mutex::new(State { table: LockTable::new(), graph: WaitForGraph::new() }) }
    }

    /// Apply a committed command. Deterministic and idempotent: applying
    /// `acquire_lock(L, A)` twice in a row leaves `owners == [A]`.
    pub async fn apply(&self, command: LockCommand) {
        let mut st = self.state.lock().await;
        Self::apply_locked(&mut st, command);
    }

    fn apply_locked(st: &mut State, command: LockCommand) {
        match command {
            LockCommand::AcquireLock { lock_name, lock_type, requester } => {
                let entry = st.table.entry(lock_name).or_insert_with(|| LockEntry::new(lock_type));
                if !entry.owners.contains(&requester) {
                    entry.owners.push(requester.clone());
                    entry.lock_type = lock_type;
                }
                if let Some(edges) = st.graph.get_mut(&requester) {
                    let owners = entry.owners.clone();
                    edges.retain(|n| !owners.contains(n));
                    if edges.is_empty() {
                        st.graph.remove(&requester);
                    }
                }
            }
            LockCommand::ReleaseLock { lock_name, requester } => {
                let Some(entry) = st.table.get_mut(&lock_name) else { return };
                let before = entry.owners.len();
                entry.owners.retain(|o| o != &requester);
                if entry.owners.len() == before {
                    return; // requester was not an owner: nothing to do
                }
                if entry.owners.is_empty() {
                    if let Some((next_node, next_type)) = entry.waiters.pop_front() {
                        Self::apply_locked(
                            st,
                            LockCommand::AcquireLock { lock_name, lock_type: next_type, requester: next_node },
                        );
                    }
                }
            }
        }
    }

    /// Leader-side admission check: is `lock_type` grantable to `requester`
    /// right now, without consulting the deadlock detector?
    pub async fn can_grant(&self, lock_name: &str, lock_type: LockType, requester: &NodeId) -> bool {
        let st = self.state.lock().await;
        match st.table.get(lock_name) {
            None => true,
            Some(entry) if entry.owners.is_empty() => true,
            Some(entry) if entry.owners.contains(requester) => true,
            Some(entry) => lock_type == LockType::Shared && entry.lock_type == LockType::Shared,
        }
    }

    pub async fn owners_of(&self, lock_name: &str) -> Vec<NodeId> {
        self.state.lock().await.table.get(lock_name).map(|e| e.owners.clone()).unwrap_or_default()
    }

    pub async fn is_owner(&self, lock_name: &str, node: &NodeId) -> bool {
        self.state.lock().await.table.get(lock_name).map(|e| e.owners.contains(node)).unwrap_or(false)
    }

    /// Simulate adding `requester -> owner` edges for each of
    /// `current_owners` and run cycle detection over the augmented graph,
    /// without mutating the real one.
    pub async fn would_deadlock(&self, requester: &NodeId, current_owners: &[NodeId]) -> bool {
        let st = self.state.lock().await;
        deadlock::would_deadlock(&st.graph, requester, current_owners)
    }

    /// Enqueue `requester` as a waiter and record the wait edges. Leader-
    /// local bookkeeping only: lost on failover, never replicated.
    pub async fn enqueue_waiter(&self, lock_name: &str, requester: NodeId, lock_type: LockType) {
        let mut st = self.state.lock().await;
        let owners = st.table.entry(lock_name.to_string()).or_insert_with(|| LockEntry::new(lock_type)).owners.clone();
        st.table.get_mut(lock_name).unwrap().waiters.push_back((requester.clone(), lock_type));
        st.graph.entry(requester).or_default().extend(owners);
    }

    pub async fn table_snapshot(&self) -> LockTable {
        self.state.lock().await.table.clone()
    }

    pub async fn graph_snapshot(&self) -> WaitForGraph {
        self.state.lock().await.graph.clone()
    }
}

#[async_trait]
impl ApplyCallback<LockCommand> for LockStateMachine {
    async fn apply(&self, command: LockCommand) {
        LockStateMachine::apply(self, command).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_idempotent_for_same_owner() {
        let sm = LockStateMachine::new();
        let cmd = || LockCommand::AcquireLock {
            lock_name: "L".into(),
            lock_type: LockType::Exclusive,
            requester: "n1".into(),
        };
        sm.apply(cmd()).await;
        sm.apply(cmd()).await;
        let table = sm.table_snapshot().await;
        assert_eq!(table["L"].owners, vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn release_promotes_next_waiter_fifo() {
        let sm = LockStateMachine::new();
        sm.apply(LockCommand::AcquireLock {
            lock_name: "L".into(),
            lock_type: LockType::Exclusive,
            requester: "n1".into(),
        })
        .await;
        sm.enqueue_waiter("L", "n2".into(), LockType::Exclusive).await;
        sm.enqueue_waiter("L", "n3".into(), LockType::Exclusive).await;

        sm.apply(LockCommand::ReleaseLock { lock_name: "L".into(), requester: "n1".into() }).await;

        let table = sm.table_snapshot().await;
        assert_eq!(table["L"].owners, vec!["n2".to_string()]);
        assert_eq!(table["L"].waiters.len(), 1);
    }

    #[tokio::test]
    async fn release_by_non_owner_is_a_no_op() {
        let sm = LockStateMachine::new();
        sm.apply(LockCommand::AcquireLock {
            lock_name: "L".into(),
            lock_type: LockType::Exclusive,
            requester: "n1".into(),
        })
        .await;
        sm.apply(LockCommand::ReleaseLock { lock_name: "L".into(), requester: "n2".into() }).await;
        assert_eq!(sm.table_snapshot().await["L"].owners, vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn shared_lock_admits_further_shared_holders() {
        let sm = LockStateMachine::new();
        sm.apply(LockCommand::AcquireLock {
            lock_name: "L".into(),
            lock_type: LockType::Shared,
            requester: "n1".into(),
        })
        .await;
        assert!(sm.can_grant("L", LockType::Shared, &"n2".to_string()).await);
        assert!(!sm.can_grant("L", LockType::Exclusive, &"n2".to_string()).await);
    }

    #[tokio::test]
    async fn exclusive_owner_blocks_all_new_acquirers() {
        let sm = LockStateMachine::new();
        sm.apply(LockCommand::AcquireLock {
            lock_name: "L".into(),
            lock_type: LockType::Exclusive,
            requester: "n1".into(),
        })
        .await;
        assert!(!sm.can_grant("L", LockType::Shared, &"n2".to_string()).await);
        assert!(sm.can_grant("L", LockType::Exclusive, &"n1".to_string()).await); // re-entrant
    }

    #[tokio::test]
    async fn acquiring_purges_resolved_wait_edges() {
        let sm = LockStateMachine::new();
        sm.apply(LockCommand::AcquireLock {
            lock_name: "A".into(),
            lock_type: LockType::Exclusive,
            requester: "n1".into(),
        })
        .await;
        sm.enqueue_waiter("A", "n2".into(), LockType::Exclusive).await;
        assert!(!sm.graph_snapshot().await.is_empty());

        sm.apply(LockCommand::ReleaseLock { lock_name: "A".into(), requester: "n1".into() }).await;
        // n2 was promoted by the release; its wait edge on n1 should be gone.
        assert!(sm.graph_snapshot().await.get("n2").is_none());
    }
}
