//! The HTTP façade: axum routes for Raft RPCs, lock requests, and the PBFT
//! surface. Thin on purpose — all decisions live in [`crate::orchestrator`];
//! handlers here only (de)serialize and translate outcomes to responses.

mod forward;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Json, Path, State};
use axum::http::Request;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use raft_engine::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::lock::LockType;
use crate::orchestrator::{AcquireOutcome, NodeOrchestrator};
use crate::pbft::{ClientRequestOutcome, MessageType, PbftMessage};

pub type SharedNode = Arc<NodeOrchestrator>;

pub fn router(node: SharedNode) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/raft/request-vote", post(raft_request_vote))
        .route("/raft/append-entries", post(raft_append_entries))
        .route("/lock/:name", post(acquire_lock).delete(release_lock))
        .route("/locks", get(list_locks))
        .route("/pbft/request", post(pbft_request))
        .route("/pbft/message", post(pbft_message))
        .route("/pbft/status", get(pbft_status))
        .route("/pbft/simulate-byzantine", post(pbft_simulate_byzantine))
        .with_state(node)
}

async fn index(State(node): State<SharedNode>) -> impl IntoResponse {
    Json(json!({ "node_id": node.config.node_id, "role": node.is_leader().await }))
}

async fn raft_request_vote(State(node): State<SharedNode>, Json(req): Json<RequestVoteRequest>) -> Json<RequestVoteResponse> {
    Json(node.raft.on_request_vote(req).await)
}

async fn raft_append_entries(
    State(node): State<SharedNode>,
    Json(req): Json<AppendEntriesRequest<crate::lock::LockCommand>>,
) -> Json<AppendEntriesResponse> {
    Json(node.raft.on_append_entries(req).await)
}

#[derive(Deserialize)]
struct AcquireQuery {
    #[serde(default = "default_lock_type")]
    lock_type: String,
}

fn default_lock_type() -> String {
    "exclusive".to_string()
}

/// Takes the raw request so a non-leader can forward it to the leader
/// verbatim (method, path, query string, body) before any of its own
/// extractors run. `Request<Body>` must be the sole parameter — axum
/// refuses to combine a body-consuming extractor with others.
async fn acquire_lock(State(node): State<SharedNode>, Path(name): Path<String>, req: Request<Body>) -> axum::response::Response {
    if !node.is_leader().await {
        return match forward::forward_to_leader(&node, req).await {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        };
    }

    let query = req.uri().query().unwrap_or("");
    let lock_type_raw = serde_urlencoded::from_str::<AcquireQuery>(query).map(|q| q.lock_type).unwrap_or_else(|_| default_lock_type());
    let Some(lock_type) = LockType::parse(&lock_type_raw) else {
        return ApiError::BadLockType(lock_type_raw).into_response();
    };

    let requester = node.config.node_id.clone();
    match node.acquire_lock(&name, lock_type, requester).await {
        Ok(AcquireOutcome::Granted { node: granted_to, term }) => {
            Json(json!({ "status": "success", "node": granted_to, "term": term })).into_response()
        }
        Ok(AcquireOutcome::Pending) => Json(json!({ "status": "pending" })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn release_lock(State(node): State<SharedNode>, Path(name): Path<String>, req: Request<Body>) -> axum::response::Response {
    if !node.is_leader().await {
        return match forward::forward_to_leader(&node, req).await {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        };
    }
    let requester = node.config.node_id.clone();
    match node.release_lock(&name, requester).await {
        Ok(()) => Json(json!({ "status": "success", "message": "release replicated" })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_locks(State(node): State<SharedNode>) -> impl IntoResponse {
    let (node_id, role, leader, table, graph) = node.locks_snapshot().await;
    Json(json!({
        "node_id": node_id,
        "raft_state": format!("{:?}", role),
        "current_leader": leader,
        "lock_table": table,
        "wait_for_graph": graph,
    }))
}

async fn pbft_request(State(node): State<SharedNode>, Json(payload): Json<serde_json::Value>) -> impl IntoResponse {
    match node.pbft_client_request(payload).await {
        ClientRequestOutcome::Started { sequence, digest } => {
            Json(json!({ "status": "consensus_started", "sequence": sequence, "digest": digest }))
        }
        ClientRequestOutcome::Forwarded { primary } => {
            Json(json!({ "status": "forwarded", "primary": primary, "message": "request forwarded to primary" }))
        }
    }
}

async fn pbft_message(State(node): State<SharedNode>, Json(payload): Json<serde_json::Value>) -> axum::response::Response {
    let msg_type = match payload.get("msg_type").and_then(|v| v.as_str()) {
        Some(s) => s.to_string(),
        None => return ApiError::UnknownPbftMessage("<missing>".to_string()).into_response(),
    };
    if MessageType::from_wire(&msg_type).is_none() {
        return ApiError::UnknownPbftMessage(msg_type).into_response();
    }
    let message: PbftMessage = match serde_json::from_value(payload) {
        Ok(m) => m,
        Err(e) => return ApiError::UnknownPbftMessage(e.to_string()).into_response(),
    };
    node.pbft_protocol_message(message).await;
    Json(json!({ "status": "processed", "msg_type": msg_type })).into_response()
}

async fn pbft_status(State(node): State<SharedNode>) -> impl IntoResponse {
    Json(node.pbft_status().await)
}

#[derive(Deserialize)]
struct SimulateByzantineQuery {
    #[serde(default = "default_behavior")]
    behavior_type: String,
}

fn default_behavior() -> String {
    "conflicting_prepare".to_string()
}

async fn pbft_simulate_byzantine(State(node): State<SharedNode>, req: Request<Body>) -> axum::response::Response {
    let query = req.uri().query().unwrap_or("");
    let behavior_type = serde_urlencoded::from_str::<SimulateByzantineQuery>(query).map(|q| q.behavior_type).unwrap_or_else(|_| default_behavior());
    match node.pbft_simulate_byzantine(&behavior_type).await {
        Ok(message) => Json(json!({ "status": "byzantine_behavior_simulated", "type": behavior_type, "message": message })).into_response(),
        Err(e) => e.into_response(),
    }
}
