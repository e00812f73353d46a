use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::chaos::{ChaosController, RpcKind};
use crate::config::{ClusterNode, Config};
use crate::error::VaultError;
use crate::raft::log::LogEntry;
use crate::vault::VaultState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub conflict_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub offset: u64,
    pub data: VaultState,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Outbound RPC surface toward one peer. Abstracted so tests can route
/// calls in-process instead of over sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        peer: &ClusterNode,
        request: &VoteRequest,
    ) -> Result<VoteResponse, VaultError>;

    async fn append_entries(
        &self,
        peer: &ClusterNode,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, VaultError>;

    async fn install_snapshot(
        &self,
        peer: &ClusterNode,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, VaultError>;
}

/// JSON-over-HTTP transport used in production. Every call carries the
/// configured per-call deadline; failures are reported, never retried here
/// (the next heartbeat tick is the retry).
pub struct HttpTransport {
    client: reqwest::Client,
    chaos: Arc<ChaosController>,
}

impl HttpTransport {
    pub fn new(config: &Config, chaos: Arc<ChaosController>) -> Result<Self, VaultError> {
        let client = reqwest::Client::builder()
            .timeout(config.rpc_timeout())
            .build()
            .map_err(|e| VaultError::Internal(format!("http client: {}", e)))?;
        Ok(HttpTransport { client, chaos })
    }

    async fn post<Req, Resp>(
        &self,
        peer: &ClusterNode,
        path: &str,
        kind: RpcKind,
        request: &Req,
    ) -> Result<Resp, VaultError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.chaos.inject(kind, &peer.id).await?;

        let url = format!("{}{}", peer.url.trim_end_matches('/'), path);
        debug!("sending {} to {}", path, peer.id);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| VaultError::PeerUnavailable {
                peer: peer.id.clone(),
                reason: e.to_string(),
            })?;

        response
            .json::<Resp>()
            .await
            .map_err(|e| VaultError::PeerUnavailable {
                peer: peer.id.clone(),
                reason: format!("bad response body: {}", e),
            })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        peer: &ClusterNode,
        request: &VoteRequest,
    ) -> Result<VoteResponse, VaultError> {
        self.post(peer, "/raft/request-vote", RpcKind::RequestVote, request).await
    }

    async fn append_entries(
        &self,
        peer: &ClusterNode,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, VaultError> {
        self.post(peer, "/raft/append-entries", RpcKind::AppendEntries, request).await
    }

    async fn install_snapshot(
        &self,
        peer: &ClusterNode,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, VaultError> {
        self.post(peer, "/raft/install-snapshot", RpcKind::InstallSnapshot, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::Command;

    #[test]
    fn test_append_entries_wire_format() {
        let request = AppendEntriesRequest {
            term: 3,
            leader_id: "node-1".to_string(),
            prev_log_index: 4,
            prev_log_term: 2,
            entries: vec![LogEntry::new(5, 3, Command::Put {
                key: "a".to_string(),
                value: "1".to_string(),
            })],
            leader_commit: 4,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["prevLogIndex"], 4);
        assert_eq!(json["leaderId"], "node-1");
        assert_eq!(json["entries"][0]["command"]["put"]["key"], "a");

        let parsed: AppendEntriesRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert!(!parsed.entries[0].applied);
    }

    #[test]
    fn test_vote_request_round_trip() {
        let request = VoteRequest {
            term: 7,
            candidate_id: "node-2".to_string(),
            last_log_index: 12,
            last_log_term: 6,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("candidateId"));
        let parsed: VoteRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.last_log_term, 6);
    }
}
