//! Peer-to-peer RPC transport: Raft RPCs over HTTP via `reqwest`, plus PBFT
//! broadcast and cache-invalidation fire-and-forget sends. Peer failures
//! are logged and swallowed rather than propagated — the network is
//! expected to be unreliable and callers treat a failed peer exactly like
//! a slow one.

use std::time::Duration;

use async_trait::async_trait;
use raft_engine::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use raft_engine::{NodeId, RaftNetwork};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::lock::LockCommand;
use crate::pbft::PbftMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("request to {0} failed: {1}")]
    Request(String, reqwest::Error),
    #[error("{0} returned status {1}")]
    Status(String, reqwest::StatusCode),
}

/// HTTP-backed implementation of both the Raft peer network and the PBFT
/// broadcast channel. One `reqwest::Client` is shared across both since
/// they hit the same peer set.
pub struct HttpPeerTransport {
    client: reqwest::Client,
    rpc_deadline: Duration,
    broadcast_deadline: Duration,
}

impl HttpPeerTransport {
    pub fn new(rpc_deadline: Duration, broadcast_deadline: Duration) -> Self {
        Self { client: reqwest::Client::new(), rpc_deadline, broadcast_deadline }
    }

    async fn rpc<T, R>(&self, url: &str, body: &T, deadline: Duration) -> Result<R, TransportError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let fut = self.client.post(url).json(body).send();
        let resp = tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| TransportError::Timeout(url.to_string()))?
            .map_err(|e| TransportError::Request(url.to_string(), e))?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(url.to_string(), resp.status()));
        }
        resp.json::<R>().await.map_err(|e| TransportError::Request(url.to_string(), e))
    }

    /// Fire a message at one peer URL and swallow the result into a log
    /// line; used for broadcasts where no caller waits on individual acks.
    async fn fire_and_forget(&self, url: String, body: serde_json::Value) {
        let fut = self.client.post(&url).json(&body).send();
        match tokio::time::timeout(self.broadcast_deadline, fut).await {
            Ok(Ok(resp)) if !resp.status().is_success() => {
                tracing::warn!(%url, status = %resp.status(), "peer rejected broadcast");
            }
            Ok(Err(e)) => tracing::warn!(%url, error = %e, "broadcast send failed"),
            Err(_) => tracing::warn!(%url, "broadcast timed out"),
            Ok(Ok(_)) => {}
        }
    }
}

#[async_trait]
impl RaftNetwork<LockCommand> for HttpPeerTransport {
    async fn request_vote(&self, target: &NodeId, req: RequestVoteRequest) -> anyhow::Result<RequestVoteResponse> {
        let url = format!("{}/raft/request-vote", target);
        Ok(self.rpc(&url, &req, self.rpc_deadline).await?)
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest<LockCommand>,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let url = format!("{}/raft/append-entries", target);
        Ok(self.rpc(&url, &req, self.rpc_deadline).await?)
    }
}

impl HttpPeerTransport {
    /// Broadcast a PBFT protocol message to every peer. Best-effort: PBFT's
    /// quorum counting already tolerates up to `f` silent peers.
    pub async fn broadcast_pbft(&self, peers: &[String], msg: &PbftMessage) {
        let futures = peers.iter().map(|peer| {
            let url = format!("{peer}/pbft/message");
            let body = serde_json::to_value(msg).expect("PbftMessage always serializes");
            self.fire_and_forget(url, body)
        });
        futures::future::join_all(futures).await;
    }

    /// Broadcast a cache-invalidation notice for `key` to every peer.
    /// Supplemental to the lock protocol proper: there is no cache layer in
    /// this crate, but peers still expose `/cache/invalidate` and nothing
    /// downstream depends on removing the call.
    pub async fn broadcast_invalidate(&self, peers: &[String], key: &str) {
        let futures = peers.iter().map(|peer| {
            let url = format!("{peer}/cache/invalidate");
            let body = serde_json::json!({ "key": key });
            self.fire_and_forget(url, body)
        });
        futures::future::join_all(futures).await;
    }
}
