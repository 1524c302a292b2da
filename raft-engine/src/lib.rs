//! A leader-based log-replication consensus engine (Raft-style).
//!
//! This crate implements election, log replication, commit-index
//! advancement and a commit monitor that drives an application-supplied
//! state machine via [`network::ApplyCallback`]. It deliberately omits
//! persistence, snapshotting and cluster reconfiguration — see the crate
//! that consumes this one (`sync-node`) for the replicated lock table built
//! on top of it.

pub mod config;
pub mod metrics;
pub mod network;
pub mod raft;
pub mod types;

pub use config::Config;
pub use metrics::RaftMetrics;
pub use network::{ApplyCallback, RaftNetwork};
pub use raft::Raft;
pub use types::{
    AppendEntriesRequest, AppendEntriesResponse, Command, LogEntry, NodeId, RequestVoteRequest,
    RequestVoteResponse, Role, Term,
};
