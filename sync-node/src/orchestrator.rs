//! Wires the Raft engine, the lock state machine, the PBFT engine and the
//! HTTP transport together, and implements the leader-side admission and
//! grant-wait polling logic for lock requests.

use std::sync::Arc;
use std::time::Duration;

use raft_engine::{NodeId, Raft, Role};

use crate::config::NodeConfig;
use crate::error::ApiError;
use crate::lock::{LockCommand, LockError, LockStateMachine, LockTable, LockType, WaitForGraph};
use crate::pbft::{ClientRequestOutcome, PbftEngine, PbftMessage, PbftStatus};
use crate::transport::HttpPeerTransport;

const GRANT_POLL_ATTEMPTS: u32 = 50;
const GRANT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub enum AcquireOutcome {
    Granted { node: NodeId, term: u64 },
    Pending,
}

pub struct NodeOrchestrator {
    pub config: NodeConfig,
    pub raft: Raft<LockCommand, HttpPeerTransport>,
    pub lock_sm: Arc<LockStateMachine>,
    pub pbft: Arc<PbftEngine>,
    pub transport: Arc<HttpPeerTransport>,
}

impl NodeOrchestrator {
    pub fn new(config: NodeConfig) -> Self {
        let transport = Arc::new(HttpPeerTransport::new(config.rpc_deadline, config.broadcast_deadline));
        let raft = Raft::new(config.node_id.clone(), config.peers.clone(), config.raft.clone(), transport.clone());
        let lock_sm = Arc::new(LockStateMachine::new());
        let pbft = Arc::new(PbftEngine::new(&config, transport.clone()));
        Self { config, raft, lock_sm, pbft, transport }
    }

    /// Start background tasks: the commit monitor runs immediately (it
    /// only needs the apply callback), the election timer is armed only
    /// after `settling_delay` so a freshly-started cluster doesn't have
    /// every node racing to campaign before peers have finished booting.
    pub async fn start(&self) {
        self.raft.register_apply_callback(self.lock_sm.clone()).await;
        self.raft.start_commit_monitor().await;

        let raft = self.raft.clone();
        let delay = self.config.settling_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            raft.arm_election_timer().await;
        });
    }

    async fn leader_url(&self) -> Option<String> {
        let leader_id = self.raft.current_leader().await?;
        self.config.all_nodes.iter().find(|url| url.contains(leader_id.as_str())).cloned()
    }

    pub async fn forward_target(&self) -> Result<String, ApiError> {
        self.leader_url().await.ok_or(ApiError::NoLeader)
    }

    pub async fn is_leader(&self) -> bool {
        self.raft.role().await == Role::Leader
    }

    /// Check type compatibility, run deadlock detection against the
    /// hypothetical grant, propose the command, then poll for up to 5s for
    /// it to land in the table before reporting `Pending` to the caller.
    pub async fn acquire_lock(&self, lock_name: &str, lock_type: LockType, requester: NodeId) -> Result<AcquireOutcome, ApiError> {
        if self.lock_sm.can_grant(lock_name, lock_type, &requester).await {
            let owners = self.lock_sm.owners_of(lock_name).await;
            if self.lock_sm.would_deadlock(&requester, &owners).await {
                return Err(LockError::Deadlock.into());
            }

            let command = LockCommand::AcquireLock { lock_name: lock_name.to_string(), lock_type, requester: requester.clone() };
            if !self.raft.submit(command).await {
                return Err(LockError::ReplicationFailed.into());
            }

            for _ in 0..GRANT_POLL_ATTEMPTS {
                if self.lock_sm.is_owner(lock_name, &requester).await {
                    let term = self.raft.current_term().await;
                    return Ok(AcquireOutcome::Granted { node: requester, term });
                }
                tokio::time::sleep(GRANT_POLL_INTERVAL).await;
            }
            Ok(AcquireOutcome::Pending)
        } else {
            self.lock_sm.enqueue_waiter(lock_name, requester.clone(), lock_type).await;
            let owners = self.lock_sm.owners_of(lock_name).await;
            Err(LockError::Busy { owners }.into())
        }
    }

    pub async fn release_lock(&self, lock_name: &str, requester: NodeId) -> Result<(), ApiError> {
        if !self.lock_sm.is_owner(lock_name, &requester).await {
            return Err(ApiError::NotOwner);
        }
        let command = LockCommand::ReleaseLock { lock_name: lock_name.to_string(), requester };
        if !self.raft.submit(command).await {
            return Err(ApiError::ReplicationFailed);
        }
        Ok(())
    }

    pub async fn locks_snapshot(&self) -> (NodeId, Role, Option<NodeId>, LockTable, WaitForGraph) {
        (
            self.config.node_id.clone(),
            self.raft.role().await,
            self.raft.current_leader().await,
            self.lock_sm.table_snapshot().await,
            self.lock_sm.graph_snapshot().await,
        )
    }

    pub async fn pbft_client_request(&self, request: serde_json::Value) -> ClientRequestOutcome {
        self.pbft.handle_client_request(request).await
    }

    pub async fn pbft_protocol_message(&self, message: PbftMessage) {
        self.pbft.on_protocol_message(message).await
    }

    pub async fn pbft_status(&self) -> PbftStatus {
        self.pbft.status().await
    }

    pub async fn pbft_simulate_byzantine(&self, behavior_type: &str) -> Result<&'static str, ApiError> {
        Ok(self.pbft.simulate_byzantine(behavior_type).await?)
    }
}
