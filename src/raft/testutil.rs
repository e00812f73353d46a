use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::config::{ClusterNode, Config};
use crate::error::VaultError;
use crate::metrics::ConsensusMetrics;
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, Transport, VoteRequest, VoteResponse,
};
use crate::raft::RaftNode;

/// Routes peer RPCs to in-process nodes so multi-node scenarios run
/// without sockets. Nodes marked down behave like unreachable peers.
pub(crate) struct LoopbackNet {
    nodes: Mutex<HashMap<String, Arc<RaftNode>>>,
    down: Mutex<HashSet<String>>,
}

impl LoopbackNet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(LoopbackNet { nodes: Mutex::new(HashMap::new()), down: Mutex::new(HashSet::new()) })
    }

    pub(crate) fn register(&self, node: Arc<RaftNode>) {
        self.nodes.lock().unwrap().insert(node.node_id.clone(), node);
    }

    pub(crate) fn set_down(&self, id: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    fn target(&self, id: &str) -> Result<Arc<RaftNode>, VaultError> {
        if self.down.lock().unwrap().contains(id) {
            return Err(VaultError::PeerUnavailable {
                peer: id.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.nodes.lock().unwrap().get(id).cloned().ok_or_else(|| VaultError::PeerUnavailable {
            peer: id.to_string(),
            reason: "unknown peer".to_string(),
        })
    }
}

#[async_trait]
impl Transport for LoopbackNet {
    async fn request_vote(
        &self,
        peer: &ClusterNode,
        request: &VoteRequest,
    ) -> Result<VoteResponse, VaultError> {
        self.target(&peer.id)?.handle_request_vote(request.clone()).await
    }

    async fn append_entries(
        &self,
        peer: &ClusterNode,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, VaultError> {
        self.target(&peer.id)?.handle_append_entries(request.clone()).await
    }

    async fn install_snapshot(
        &self,
        peer: &ClusterNode,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, VaultError> {
        self.target(&peer.id)?.handle_install_snapshot(request.clone()).await
    }
}

pub(crate) fn test_config(id: &str, cluster: &[&str], data_dir: &Path) -> Arc<Config> {
    let mut config = Config::default();
    config.node.id = id.to_string();
    config.node.data_dir = data_dir.join(id);
    config.cluster.nodes = cluster
        .iter()
        .map(|&n| ClusterNode { id: n.to_string(), url: format!("http://test/{}", n) })
        .collect();
    // Tests drive ticks by hand; keep the windows small and compaction
    // easy to reach.
    config.raft.heartbeat_interval_ms = 20;
    config.raft.election_timeout_min_ms = 150;
    config.raft.election_timeout_max_ms = 300;
    config.snapshot.threshold = 8;
    Arc::new(config)
}

/// One node wired to a fresh loopback network, rooted at `data_dir` so
/// restart tests can rebuild over the same files.
pub(crate) async fn make_node(
    id: &str,
    cluster: &[&str],
    data_dir: &Path,
) -> (Arc<RaftNode>, Arc<LoopbackNet>) {
    let net = LoopbackNet::new();
    let config = test_config(id, cluster, data_dir);
    let metrics = Arc::new(ConsensusMetrics::new(config.metrics.event_capacity));
    let node = RaftNode::new(config, net.clone(), metrics).unwrap();
    net.register(node.clone());
    (node, net)
}

/// A whole cluster on one loopback network. The TempDir keeps every
/// node's durable files alive for the duration of the test.
pub(crate) async fn make_cluster(
    ids: &[&str],
) -> (Arc<LoopbackNet>, Vec<Arc<RaftNode>>, TempDir) {
    let dir = TempDir::new().unwrap();
    let net = LoopbackNet::new();
    let mut nodes = Vec::new();
    for id in ids {
        let config = test_config(id, ids, dir.path());
        let metrics = Arc::new(ConsensusMetrics::new(config.metrics.event_capacity));
        let node = RaftNode::new(config, net.clone(), metrics).unwrap();
        net.register(node.clone());
        nodes.push(node);
    }
    (net, nodes, dir)
}
