//! The peer-facing seams a `Raft` instance is generic over: sending RPCs to
//! peers, and applying committed commands to the replicated state machine.
//!
//! Kept as traits (rather than a concrete `reqwest` client baked into the
//! engine) so tests can swap in an in-memory fake and the binary crate can
//! own the real HTTP transport.

use async_trait::async_trait;

use crate::types::{AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse};

/// Peer RPC transport as seen by the Raft engine. Implementations must never
/// panic or propagate connection/timeout errors to the engine as anything
/// other than `Err`; the engine treats any `Err` as "peer did not respond"
/// and proceeds with the conservative default (vote not granted, append not
/// acknowledged).
#[async_trait]
pub trait RaftNetwork<C>: Send + Sync + 'static
where
    C: crate::types::Command,
{
    async fn request_vote(&self, target: &NodeId, req: RequestVoteRequest) -> anyhow::Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest<C>,
    ) -> anyhow::Result<AppendEntriesResponse>;
}

/// The Raft apply callback: invoked by the commit monitor exactly once per
/// log index, strictly in order. Implemented by the application's
/// replicated state machine (the lock table, in this crate).
#[async_trait]
pub trait ApplyCallback<C>: Send + Sync + 'static
where
    C: crate::types::Command,
{
    async fn apply(&self, command: C);
}
