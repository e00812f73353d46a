use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("not the leader")]
    NotLeader { leader: Option<String> },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("peer {peer} unavailable: {reason}")]
    PeerUnavailable { peer: String, reason: String },

    #[error("durable write failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    pub fn status(&self) -> StatusCode {
        match self {
            VaultError::NotLeader { .. } => StatusCode::FORBIDDEN,
            VaultError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            VaultError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            VaultError::PeerUnavailable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for VaultError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
