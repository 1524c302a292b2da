//! Replicated lock manager, PBFT consensus surface and the HTTP façade
//! that ties them to the Raft engine in `raft-engine`.

pub mod config;
pub mod error;
pub mod http;
pub mod lock;
pub mod orchestrator;
pub mod pbft;
pub mod transport;
