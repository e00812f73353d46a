use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::chaos::{ChaosConfig, ChaosController};
use crate::error::VaultError;
use crate::metrics::ConsensusMetrics;
use crate::raft::rpc::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use crate::raft::{RaftNode, WriteProgress};
use crate::vault::Command;

pub struct AppState {
    pub node: Arc<RaftNode>,
    pub metrics: Arc<ConsensusMetrics>,
    pub chaos: Arc<ChaosController>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteAccepted {
    pub leader_id: String,
    pub term: u64,
    pub log_index: u64,
    pub status: WriteProgress,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotLeaderBody {
    pub leader_id: Option<String>,
    pub term: u64,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadBody {
    pub value: Option<String>,
    pub found: bool,
    pub term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteStatusQuery {
    pub term: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteStatusBody {
    pub log_index: u64,
    pub status: WriteProgress,
    pub commit_index: u64,
    pub term: u64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // client key-value surface
        .route("/vault/key", put(put_key))
        .route("/vault/key/:key", get(get_key).delete(delete_key))
        .route("/vault/all", get(get_all))
        .route("/vault/status/:index", get(write_status))
        // peer RPC surface
        .route("/raft/request-vote", post(request_vote))
        .route("/raft/append-entries", post(append_entries))
        .route("/raft/install-snapshot", post(install_snapshot))
        // operational surface
        .route("/health", get(health))
        .route("/raft/state", get(raft_state))
        .route("/metrics/summary", get(metrics_summary))
        .route("/metrics/events", get(metrics_events))
        .route("/snapshots/create", post(snapshots_create))
        .route("/snapshots/status", get(snapshots_status))
        .route("/chaos/configure", post(chaos_configure))
        .route("/chaos/reset", post(chaos_reset))
        .route("/chaos/status", get(chaos_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn raft_state(State(state): State<Arc<AppState>>) -> Response {
    Json(state.node.status().await).into_response()
}

async fn not_leader(state: &AppState, leader: Option<String>) -> Response {
    let term = state.node.status().await.term;
    (
        StatusCode::FORBIDDEN,
        Json(NotLeaderBody {
            leader_id: leader,
            term,
            message: "not the leader; redirect to leaderId".to_string(),
        }),
    )
        .into_response()
}

async fn submit_write(state: &AppState, command: Command) -> Response {
    match state.node.propose(command).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(WriteAccepted {
                leader_id: state.node.node_id.clone(),
                term: receipt.term,
                log_index: receipt.log_index,
                status: WriteProgress::Pending,
            }),
        )
            .into_response(),
        Err(VaultError::NotLeader { leader }) => not_leader(state, leader).await,
        Err(e) => e.into_response(),
    }
}

async fn put_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PutRequest>,
) -> Response {
    submit_write(&state, Command::Put { key: request.key, value: request.value }).await
}

async fn delete_key(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    submit_write(&state, Command::Delete { key }).await
}

async fn get_key(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.node.read(&key).await {
        Ok(view) => {
            let status = if view.found { StatusCode::OK } else { StatusCode::NOT_FOUND };
            (
                status,
                Json(ReadBody {
                    value: view.value,
                    found: view.found,
                    term: view.term,
                    leader_id: view.leader_id,
                    commit_index: view.commit_index,
                    last_applied_index: view.last_applied_index,
                }),
            )
                .into_response()
        }
        Err(VaultError::NotLeader { leader }) => not_leader(&state, leader).await,
        Err(e) => e.into_response(),
    }
}

async fn get_all(State(state): State<Arc<AppState>>) -> Response {
    match state.node.dump_all().await {
        Ok(map) => Json(map).into_response(),
        Err(VaultError::NotLeader { leader }) => not_leader(&state, leader).await,
        Err(e) => e.into_response(),
    }
}

async fn write_status(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u64>,
    Query(query): Query<WriteStatusQuery>,
) -> Response {
    match state.node.write_status(index, query.term).await {
        Ok(progress) => {
            let status = state.node.status().await;
            Json(WriteStatusBody {
                log_index: index,
                status: progress,
                commit_index: status.commit_index,
                term: status.term,
            })
            .into_response()
        }
        Err(VaultError::NotLeader { leader }) => not_leader(&state, leader).await,
        Err(e) => e.into_response(),
    }
}

async fn request_vote(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VoteRequest>,
) -> Response {
    match state.node.handle_request_vote(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn append_entries(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Response {
    match state.node.handle_append_entries(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn install_snapshot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InstallSnapshotRequest>,
) -> Response {
    match state.node.handle_install_snapshot(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn metrics_summary(State(state): State<Arc<AppState>>) -> Response {
    Json(state.metrics.summary().await).into_response()
}

async fn metrics_events(State(state): State<Arc<AppState>>) -> Response {
    Json(state.metrics.events().await).into_response()
}

async fn snapshots_create(State(state): State<Arc<AppState>>) -> Response {
    match state.node.create_snapshot().await {
        Ok(snapshot) => {
            info!(
                "snapshot created on request at index {}",
                snapshot.last_included_index
            );
            Json(state.node.snapshots.status()).into_response()
        }
        Err(e @ VaultError::Snapshot(_)) => {
            (StatusCode::CONFLICT, Json(serde_json::json!({ "message": e.to_string() })))
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn snapshots_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.node.snapshots.status()).into_response()
}

async fn chaos_configure(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ChaosConfig>,
) -> Response {
    state.chaos.configure(config).await;
    Json(state.chaos.status().await).into_response()
}

async fn chaos_reset(State(state): State<Arc<AppState>>) -> Response {
    state.chaos.reset().await;
    Json(state.chaos.status().await).into_response()
}

async fn chaos_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.chaos.status().await).into_response()
}
