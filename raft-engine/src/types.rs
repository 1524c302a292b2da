//! Shared Raft types: node identity, roles, log entries and RPC payloads.

use serde::{Deserialize, Serialize};

/// A stable identifier for a node. In this crate it is always the bare
/// `host:port`-derived id configured at startup, never re-derived from a URL
/// at call time (see `DESIGN.md` for why).
pub type NodeId = String;

/// A monotonically increasing Raft election epoch.
pub type Term = u64;

/// The three Raft roles. Starts at `Follower`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A single replicated log entry: the term it was created in, and the
/// application command it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub term: Term,
    pub command: C,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest<C> {
    pub term: Term,
    pub leader_id: NodeId,
    pub entries: Vec<LogEntry<C>>,
    pub prev_log_index: u64,
    pub prev_log_term: Term,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

/// Bound required of any command type this engine will replicate: cloneable,
/// debuggable, and serializable so a `RaftNetwork` impl can ship it over the
/// wire.
pub trait Command:
    Clone + std::fmt::Debug + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}
impl<T> Command for T where
    T: Clone + std::fmt::Debug + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}
