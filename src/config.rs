use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub raft: RaftTimingConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub chaos: ChaosSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub id: String,
    pub listen_addr: String,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub nodes: Vec<ClusterNode>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        // A lone dev node that elects itself.
        ClusterConfig {
            nodes: vec![ClusterNode {
                id: "node-1".to_string(),
                url: "http://127.0.0.1:7400".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaftTimingConfig {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub rpc_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub max_entries_per_append: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    pub threshold: u64,
    pub retain_backups: usize,
    pub compress: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChaosSettings {
    pub enabled: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: "node-1".to_string(),
            listen_addr: "127.0.0.1:7400".to_string(),
            data_dir: PathBuf::from("./data/node-1"),
        }
    }
}

impl Default for RaftTimingConfig {
    fn default() -> Self {
        RaftTimingConfig {
            heartbeat_interval_ms: 500,
            election_timeout_min_ms: 3000,
            election_timeout_max_ms: 6000,
            rpc_timeout_ms: 1000,
            tick_interval_ms: 50,
            max_entries_per_append: 256,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            threshold: 10_000,
            retain_backups: 3,
            compress: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig { event_capacity: 1024 }
    }
}

impl Default for ChaosSettings {
    fn default() -> Self {
        ChaosSettings { enabled: false }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.nodes.is_empty() {
            bail!("cluster.nodes must list every member of the cluster");
        }
        if !self.cluster.nodes.iter().any(|n| n.id == self.node.id) {
            bail!("node.id '{}' is not listed in cluster.nodes", self.node.id);
        }
        if self.raft.election_timeout_min_ms >= self.raft.election_timeout_max_ms {
            bail!("election_timeout_min_ms must be below election_timeout_max_ms");
        }
        if self.raft.election_timeout_min_ms < self.raft.heartbeat_interval_ms * 5 {
            warn!(
                "election timeout {}ms is close to the heartbeat interval {}ms; spurious elections likely",
                self.raft.election_timeout_min_ms, self.raft.heartbeat_interval_ms
            );
        }
        Ok(())
    }

    /// All cluster members except this node.
    pub fn peers(&self) -> Vec<ClusterNode> {
        self.cluster
            .nodes
            .iter()
            .filter(|n| n.id != self.node.id)
            .cloned()
            .collect()
    }

    pub fn majority(&self) -> usize {
        self.cluster.nodes.len() / 2 + 1
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.raft.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.raft.rpc_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.raft.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_config() -> Config {
        let mut config = Config::default();
        config.node.id = "node-1".to_string();
        config.cluster.nodes = vec![
            ClusterNode { id: "node-1".to_string(), url: "http://127.0.0.1:7401".to_string() },
            ClusterNode { id: "node-2".to_string(), url: "http://127.0.0.1:7402".to_string() },
            ClusterNode { id: "node-3".to_string(), url: "http://127.0.0.1:7403".to_string() },
        ];
        config
    }

    #[test]
    fn test_peers_excludes_self() {
        let config = three_node_config();
        let peers = config.peers();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|p| p.id != "node-1"));
    }

    #[test]
    fn test_majority() {
        let config = three_node_config();
        assert_eq!(config.majority(), 2);

        let mut five = three_node_config();
        five.cluster.nodes.push(ClusterNode { id: "node-4".to_string(), url: String::new() });
        five.cluster.nodes.push(ClusterNode { id: "node-5".to_string(), url: String::new() });
        assert_eq!(five.majority(), 3);
    }

    #[test]
    fn test_validate_rejects_unknown_self() {
        let mut config = three_node_config();
        config.node.id = "node-9".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let mut config = three_node_config();
        config.raft.election_timeout_min_ms = 8000;
        config.raft.election_timeout_max_ms = 4000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [node]
            id = "node-2"
            listen_addr = "0.0.0.0:7402"
            data_dir = "/var/lib/raftvault/node-2"

            [cluster]
            nodes = [
                { id = "node-1", url = "http://10.0.0.1:7401" },
                { id = "node-2", url = "http://10.0.0.2:7402" },
                { id = "node-3", url = "http://10.0.0.3:7403" },
            ]

            [raft]
            heartbeat_interval_ms = 500
            election_timeout_min_ms = 3000
            election_timeout_max_ms = 6000
            rpc_timeout_ms = 1000
            tick_interval_ms = 50
            max_entries_per_append = 128
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.id, "node-2");
        assert_eq!(config.cluster.nodes.len(), 3);
        assert_eq!(config.raft.max_entries_per_append, 128);
        assert_eq!(config.snapshot.threshold, 10_000);
        assert!(!config.chaos.enabled);
        config.validate().unwrap();
    }
}
