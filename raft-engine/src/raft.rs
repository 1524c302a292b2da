//! The Raft engine: leader election, log replication, commit-index
//! advancement and the commit monitor that drives the application's state
//! machine.
//!
//! Concurrency model: a single `tokio::sync::Mutex<CoreState<C>>` guards
//! role/term/log/commit bookkeeping — one coarse mutex per engine. Background
//! tasks
//! (election timer, heartbeat loop, commit monitor) never hold that lock
//! across an `.await` on network I/O: they snapshot what they need, release
//! the lock, do the RPC, then reacquire to record the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::abortable;
use futures::future::AbortHandle;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::config::Config;
use crate::metrics::{self, RaftMetrics};
use crate::network::{ApplyCallback, RaftNetwork};
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, Command, LogEntry, NodeId, RequestVoteRequest,
    RequestVoteResponse, Role, Term,
};

struct CoreState<C> {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry<C>>,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
}

impl<C: Command> CoreState<C> {
    fn new() -> Self {
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at 1-indexed `index`, or 0 if `index == 0`.
    fn term_at(&self, index: u64) -> Term {
        if index == 0 {
            0
        } else {
            self.log.get(index as usize - 1).map(|e| e.term).unwrap_or(0)
        }
    }
}

struct Inner<C, N> {
    id: NodeId,
    peers: Vec<NodeId>,
    config: Config,
    network: Arc<N>,
    state: Mutex<CoreState<C>>,
    apply_cb: Mutex<Option<Arc<dyn ApplyCallback<C>>>>,
    metrics_tx: watch::Sender<RaftMetrics>,
    metrics_rx: watch::Receiver<RaftMetrics>,
    election_timer: Mutex<Option<AbortHandle>>,
    heartbeat_task: Mutex<Option<AbortHandle>>,
}

/// Handle to a running Raft node. Cheap to `clone`; clones share the same
/// underlying state and background tasks.
pub struct Raft<C, N> {
    inner: Arc<Inner<C, N>>,
}

impl<C, N> Clone for Raft<C, N> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C, N> Raft<C, N>
where
    C: Command,
    N: RaftNetwork<C>,
{
    pub fn new(id: NodeId, peers: Vec<NodeId>, config: Config, network: Arc<N>) -> Self {
        let (metrics_tx, metrics_rx) = metrics::channel(id.clone());
        let inner = Inner {
            id,
            peers,
            config,
            network,
            state: Mutex::new(CoreState::new()),
            apply_cb: Mutex::new(None),
            metrics_tx,
            metrics_rx,
            election_timer: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Register the state machine's apply callback. Must be called before
    /// [`Raft::activate`].
    pub async fn register_apply_callback(&self, cb: Arc<dyn ApplyCallback<C>>) {
        *self.inner.apply_cb.lock().await = Some(cb);
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.metrics_rx.clone()
    }

    /// Start the commit monitor loop. Safe to call as soon as the apply
    /// callback is registered; does not require peers to be reachable.
    pub async fn start_commit_monitor(&self) {
        self.spawn_commit_monitor();
    }

    /// Arm the election timer, allowing this node to campaign once it times
    /// out waiting for a leader's heartbeat.
    pub async fn arm_election_timer(&self) {
        self.reset_election_timer().await;
    }

    /// Convenience for callers (tests, single-process demos) that don't
    /// need the settling delay the Node Orchestrator inserts between
    /// starting the commit monitor and arming the election timer. Startup is
    /// explicit rather than constructor-driven so the scheduler is already
    /// available when background tasks spawn.
    pub async fn activate(&self) {
        self.start_commit_monitor().await;
        self.arm_election_timer().await;
    }

    pub async fn role(&self) -> Role {
        self.inner.state.lock().await.role
    }

    pub async fn current_term(&self) -> Term {
        self.inner.state.lock().await.current_term
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.inner.state.lock().await.leader_id.clone()
    }

    pub async fn log_len(&self) -> u64 {
        self.inner.state.lock().await.last_log_index()
    }

    pub async fn commit_index(&self) -> u64 {
        self.inner.state.lock().await.commit_index
    }

    pub async fn last_applied(&self) -> u64 {
        self.inner.state.lock().await.last_applied
    }

    /// Append `command` to the log at the leader. Returns `false` — not an
    /// error — when this node is not the leader; the caller (Node
    /// Orchestrator) is responsible for forwarding to the current leader.
    pub async fn submit(&self, command: C) -> bool {
        let mut st = self.inner.state.lock().await;
        if st.role != Role::Leader {
            return false;
        }
        let term = st.current_term;
        st.log.push(LogEntry { term, command });
        self.publish_metrics(&st);
        true
    }

    // ---- RPC handlers ---------------------------------------------------

    #[tracing::instrument(level = "debug", skip(self, req), fields(id = %self.inner.id))]
    pub async fn on_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut st = self.inner.state.lock().await;
        if req.term < st.current_term {
            return RequestVoteResponse { term: st.current_term, vote_granted: false };
        }
        if req.term > st.current_term {
            self.step_down_locked(&mut st, req.term);
        }

        let log_ok = req.last_log_term > st.last_log_term()
            || (req.last_log_term == st.last_log_term() && req.last_log_index >= st.last_log_index());
        let can_vote = st.voted_for.is_none() || st.voted_for.as_deref() == Some(req.candidate_id.as_str());

        let grant = can_vote && log_ok;
        if grant {
            st.voted_for = Some(req.candidate_id.clone());
            tracing::debug!(candidate = %req.candidate_id, term = req.term, "vote granted");
        }
        let term = st.current_term;
        self.publish_metrics(&st);
        drop(st);
        if grant {
            self.reset_election_timer().await;
        }
        RequestVoteResponse { term, vote_granted: grant }
    }

    #[tracing::instrument(level = "debug", skip(self, req), fields(id = %self.inner.id))]
    pub async fn on_append_entries(&self, req: AppendEntriesRequest<C>) -> AppendEntriesResponse {
        let mut st = self.inner.state.lock().await;
        if req.term < st.current_term {
            return AppendEntriesResponse { term: st.current_term, success: false };
        }
        if req.term > st.current_term {
            self.step_down_locked(&mut st, req.term);
        } else {
            st.role = Role::Follower;
        }
        st.leader_id = Some(req.leader_id.clone());

        if req.prev_log_index > 0 {
            let consistent =
                st.last_log_index() >= req.prev_log_index && st.term_at(req.prev_log_index) == req.prev_log_term;
            if !consistent {
                let term = st.current_term;
                self.publish_metrics(&st);
                drop(st);
                self.reset_election_timer().await;
                return AppendEntriesResponse { term, success: false };
            }
        }

        if !req.entries.is_empty() {
            st.log.truncate(req.prev_log_index as usize);
            st.log.extend(req.entries);
        }
        if req.leader_commit > st.commit_index {
            st.commit_index = req.leader_commit.min(st.last_log_index());
        }
        let term = st.current_term;
        self.publish_metrics(&st);
        drop(st);
        self.reset_election_timer().await;
        AppendEntriesResponse { term, success: true }
    }

    // ---- term / role transitions ----------------------------------------

    fn step_down_locked(&self, st: &mut CoreState<C>, term: Term) {
        st.role = Role::Follower;
        st.current_term = term;
        st.voted_for = None;
    }

    async fn step_down(&self, term: Term) {
        {
            let mut st = self.inner.state.lock().await;
            if term < st.current_term {
                return;
            }
            self.step_down_locked(&mut st, term);
            self.publish_metrics(&st);
        }
        self.cancel_heartbeat().await;
        self.reset_election_timer().await;
    }

    fn publish_metrics(&self, st: &CoreState<C>) {
        let _ = self.inner.metrics_tx.send(RaftMetrics {
            id: self.inner.id.clone(),
            role: st.role,
            current_term: st.current_term,
            last_log_index: st.last_log_index(),
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            current_leader: st.leader_id.clone(),
        });
    }

    // ---- election ---------------------------------------------------------

    fn random_election_timeout(&self) -> Duration {
        let (min, max) = (self.inner.config.election_timeout_min, self.inner.config.election_timeout_max);
        let span_ms = max.saturating_sub(min).as_millis().max(1) as u64;
        let extra_ms = rand::thread_rng().gen_range(0..=span_ms);
        min + Duration::from_millis(extra_ms)
    }

    async fn reset_election_timer(&self) {
        let mut guard = self.inner.election_timer.lock().await;
        if let Some(h) = guard.take() {
            h.abort();
        }
        if self.role().await == Role::Leader {
            return;
        }
        let dur = self.random_election_timeout();
        let this = self.clone();
        let (fut, handle) = abortable(async move {
            tokio::time::sleep(dur).await;
            this.become_candidate().await;
        });
        tokio::spawn(fut);
        *guard = Some(handle);
    }

    async fn cancel_heartbeat(&self) {
        let mut guard = self.inner.heartbeat_task.lock().await;
        if let Some(h) = guard.take() {
            h.abort();
        }
    }

    #[tracing::instrument(level = "info", skip(self), fields(id = %self.inner.id))]
    async fn become_candidate(&self) {
        let (term, last_log_index, last_log_term) = {
            let mut st = self.inner.state.lock().await;
            st.role = Role::Candidate;
            st.current_term += 1;
            st.voted_for = Some(self.inner.id.clone());
            st.leader_id = None;
            self.publish_metrics(&st);
            (st.current_term, st.last_log_index(), st.last_log_term())
        };
        tracing::info!(term, "election timeout: starting campaign");
        self.reset_election_timer().await;

        let total_nodes = self.inner.peers.len() + 1;
        let needed = total_nodes / 2 + 1;
        let mut votes = 1usize; // self-vote
        if votes >= needed {
            self.become_leader(term).await;
            return;
        }

        let req = RequestVoteRequest {
            term,
            candidate_id: self.inner.id.clone(),
            last_log_index,
            last_log_term,
        };
        let mut calls = FuturesUnordered::new();
        for peer in &self.inner.peers {
            let network = self.inner.network.clone();
            let peer = peer.clone();
            let req = req.clone();
            calls.push(async move { network.request_vote(&peer, req).await });
        }

        while let Some(result) = calls.next().await {
            {
                // Abandon a stale campaign: already stepped down, or a
                // concurrent reply already won/lost the election.
                let st = self.inner.state.lock().await;
                if st.role != Role::Candidate || st.current_term != term {
                    return;
                }
            }
            match result {
                Ok(reply) if reply.term > term => {
                    self.step_down(reply.term).await;
                    return;
                }
                Ok(reply) if reply.vote_granted => {
                    votes += 1;
                    if votes >= needed {
                        self.become_leader(term).await;
                        return;
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    // transport failure: defaults to vote not granted, no retry this term
                }
            }
        }
    }

    // ---- leader operation ---------------------------------------------------

    #[tracing::instrument(level = "info", skip(self), fields(id = %self.inner.id))]
    async fn become_leader(&self, term: Term) {
        {
            let mut st = self.inner.state.lock().await;
            if st.current_term != term || st.role == Role::Leader {
                return;
            }
            st.role = Role::Leader;
            st.leader_id = Some(self.inner.id.clone());
            let last_idx = st.last_log_index();
            for peer in &self.inner.peers {
                st.next_index.insert(peer.clone(), last_idx + 1);
                st.match_index.insert(peer.clone(), 0);
            }
            self.publish_metrics(&st);
        }
        tracing::info!(term, "became leader");

        {
            let mut timer = self.inner.election_timer.lock().await;
            if let Some(h) = timer.take() {
                h.abort();
            }
        }
        self.spawn_heartbeat_loop().await;
    }

    async fn spawn_heartbeat_loop(&self) {
        let this = self.clone();
        let (fut, handle) = abortable(async move {
            loop {
                this.send_append_entries_round().await;
                tokio::time::sleep(this.inner.config.heartbeat_interval).await;
            }
        });
        tokio::spawn(fut);
        *self.inner.heartbeat_task.lock().await = Some(handle);
    }

    async fn send_append_entries_round(&self) {
        let term = {
            let st = self.inner.state.lock().await;
            if st.role != Role::Leader {
                return;
            }
            st.current_term
        };

        for peer in self.inner.peers.clone() {
            let snapshot = {
                let st = self.inner.state.lock().await;
                if st.role != Role::Leader || st.current_term != term {
                    return;
                }
                let next = *st.next_index.get(&peer).unwrap_or(&1);
                let prev_log_index = next.saturating_sub(1);
                let prev_log_term = st.term_at(prev_log_index);
                let entries: Vec<LogEntry<C>> = if (prev_log_index as usize) < st.log.len() {
                    st.log[prev_log_index as usize..].to_vec()
                } else {
                    Vec::new()
                };
                (prev_log_index, prev_log_term, entries, st.commit_index)
            };
            let (prev_log_index, prev_log_term, entries, leader_commit) = snapshot;
            let n_entries = entries.len() as u64;
            let req = AppendEntriesRequest {
                term,
                leader_id: self.inner.id.clone(),
                entries,
                prev_log_index,
                prev_log_term,
                leader_commit,
            };

            match self.inner.network.append_entries(&peer, req).await {
                Ok(reply) if reply.term > term => {
                    self.step_down(reply.term).await;
                    return;
                }
                Ok(reply) => {
                    let mut st = self.inner.state.lock().await;
                    if st.role != Role::Leader || st.current_term != term {
                        continue;
                    }
                    if reply.success {
                        st.next_index.insert(peer.clone(), prev_log_index + n_entries + 1);
                        st.match_index.insert(peer.clone(), prev_log_index + n_entries);
                    } else {
                        let cur = *st.next_index.get(&peer).unwrap_or(&1);
                        st.next_index.insert(peer.clone(), cur.saturating_sub(1).max(1));
                    }
                }
                Err(_) => {
                    // ignored per-peer; the next heartbeat tick retries
                }
            }
        }

        self.advance_commit_index(term).await;
    }

    /// Advance `commit_index` to the highest `N` such that `log[N].term ==
    /// current_term` and a majority of nodes (including self) have
    /// replicated up to `N`. Entries from prior terms are never committed
    /// by majority alone — they ride in indirectly via a later
    /// current-term entry, per the Leader Completeness property.
    async fn advance_commit_index(&self, term: Term) {
        let mut st = self.inner.state.lock().await;
        if st.role != Role::Leader || st.current_term != term {
            return;
        }
        let total_nodes = self.inner.peers.len() + 1;
        let mut n = st.last_log_index();
        while n > st.commit_index {
            if st.term_at(n) == st.current_term {
                let mut count = 1; // self
                for peer in &self.inner.peers {
                    if *st.match_index.get(peer).unwrap_or(&0) >= n {
                        count += 1;
                    }
                }
                if count * 2 > total_nodes {
                    st.commit_index = n;
                    break;
                }
            }
            n -= 1;
        }
        self.publish_metrics(&st);
    }

    // ---- commit monitor -----------------------------------------------------

    fn spawn_commit_monitor(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let pending = {
                    let st = this.inner.state.lock().await;
                    if st.commit_index > st.last_applied {
                        st.log.get(st.last_applied as usize).map(|e| e.command.clone())
                    } else {
                        None
                    }
                };
                match pending {
                    Some(command) => {
                        let cb = this.inner.apply_cb.lock().await.clone();
                        if let Some(cb) = cb {
                            cb.apply(command).await;
                        }
                        let mut st = this.inner.state.lock().await;
                        st.last_applied += 1;
                        this.publish_metrics(&st);
                    }
                    None => {
                        tokio::time::sleep(this.inner.config.commit_monitor_interval).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;

    /// A `RaftNetwork` that answers each peer's `request_vote` with a
    /// canned response instead of routing to a real peer, so a candidacy's
    /// vote tally can be pinned exactly rather than left to election-timer
    /// races.
    struct ScriptedVotes(HashMap<NodeId, bool>);

    #[async_trait]
    impl RaftNetwork<()> for ScriptedVotes {
        async fn request_vote(&self, target: &NodeId, req: RequestVoteRequest) -> anyhow::Result<RequestVoteResponse> {
            Ok(RequestVoteResponse { term: req.term, vote_granted: *self.0.get(target).unwrap_or(&false) })
        }

        async fn append_entries(
            &self,
            _target: &NodeId,
            _req: AppendEntriesRequest<()>,
        ) -> anyhow::Result<AppendEntriesResponse> {
            unreachable!("not exercised by become_candidate")
        }
    }

    fn test_config() -> Config {
        Config::builder()
            .election_timeout_min(Duration::from_millis(100))
            .election_timeout_max(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    /// A 4-node cluster's candidate must reach `floor(4/2)+1 = 3` votes, not
    /// 2, to win. With only one of three peers granting a vote the
    /// candidate has 2 of 4 (self plus one peer) — short of a majority — so
    /// it must remain a Candidate rather than self-promote to Leader.
    #[tokio::test]
    async fn even_sized_cluster_needs_true_majority_not_half() {
        let peers = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];
        let mut grants = HashMap::new();
        grants.insert("n1".to_string(), true);
        grants.insert("n2".to_string(), false);
        grants.insert("n3".to_string(), false);
        let network = Arc::new(ScriptedVotes(grants));

        let raft: Raft<(), ScriptedVotes> = Raft::new("n0".to_string(), peers, test_config(), network);
        raft.become_candidate().await;

        assert_eq!(raft.role().await, Role::Candidate);
        assert_eq!(raft.current_term().await, 1);
    }
}
