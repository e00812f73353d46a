use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;

use crate::config::ClusterNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Volatile node state plus the leader-only replication bookkeeping.
/// Guarded as a whole by the node mutex; `next_index`/`match_index` are
/// rebuilt on every promotion and never persisted.
#[derive(Debug)]
pub struct NodeState {
    pub role: NodeRole,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,
    pub election_deadline: Instant,
}

impl NodeState {
    pub fn new() -> Self {
        NodeState {
            role: NodeRole::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now(),
        }
    }

    pub fn begin_leadership(&mut self, peers: &[ClusterNode], last_index: u64) {
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer.id.clone(), last_index + 1);
            self.match_index.insert(peer.id.clone(), 0);
        }
    }

    pub fn end_leadership(&mut self) {
        self.next_index.clear();
        self.match_index.clear();
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<ClusterNode> {
        vec![
            ClusterNode { id: "node-2".to_string(), url: String::new() },
            ClusterNode { id: "node-3".to_string(), url: String::new() },
        ]
    }

    #[test]
    fn test_initial_state() {
        let state = NodeState::new();
        assert_eq!(state.role, NodeRole::Follower);
        assert_eq!(state.current_term, 0);
        assert!(state.voted_for.is_none());
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.last_applied, 0);
    }

    #[test]
    fn test_begin_leadership_resets_bookkeeping() {
        let mut state = NodeState::new();
        state.match_index.insert("node-2".to_string(), 99);

        state.begin_leadership(&peers(), 7);
        assert_eq!(state.next_index["node-2"], 8);
        assert_eq!(state.next_index["node-3"], 8);
        assert_eq!(state.match_index["node-2"], 0);
        assert_eq!(state.match_index["node-3"], 0);
    }

    #[test]
    fn test_end_leadership_discards_bookkeeping() {
        let mut state = NodeState::new();
        state.begin_leadership(&peers(), 3);
        state.end_leadership();
        assert!(state.next_index.is_empty());
        assert!(state.match_index.is_empty());
    }
}
