//! HTTP-facing error type. Engine internals (`raft-engine`, `lock`, `pbft`)
//! never depend on status codes; this module is the only place that
//! translates a structured outcome into one.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::lock::LockError;
use crate::pbft::PbftError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("deadlock detected")]
    Deadlock,
    #[error("lock busy, request enqueued")]
    Busy { owners: Vec<String> },
    #[error("no leader known")]
    NoLeader,
    #[error("lock not found or not owned by this node")]
    NotOwner,
    #[error("invalid lock type: {0}")]
    BadLockType(String),
    #[error("failed to replicate log entry")]
    ReplicationFailed,
    #[error("unknown pbft message type: {0}")]
    UnknownPbftMessage(String),
    #[error("forwarding to leader failed: {0}")]
    ForwardFailed(String),
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Deadlock => ApiError::Deadlock,
            LockError::Busy { owners } => ApiError::Busy { owners },
            LockError::ReplicationFailed => ApiError::ReplicationFailed,
        }
    }
}

impl From<PbftError> for ApiError {
    fn from(e: PbftError) -> Self {
        match e {
            PbftError::UnknownBehavior(s) => ApiError::UnknownPbftMessage(s),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Deadlock => StatusCode::CONFLICT,
            ApiError::Busy { .. } => StatusCode::LOCKED,
            ApiError::NoLeader => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotOwner => StatusCode::NOT_FOUND,
            ApiError::BadLockType(_) => StatusCode::BAD_REQUEST,
            ApiError::ReplicationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::UnknownPbftMessage(_) => StatusCode::BAD_REQUEST,
            ApiError::ForwardFailed(_) => StatusCode::BAD_GATEWAY,
        };
        let body = match &self {
            ApiError::Busy { owners } => json!({ "error": self.to_string(), "owners": owners }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
