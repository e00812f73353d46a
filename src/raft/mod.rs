use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub mod applier;
pub mod log;
pub mod persistence;
pub mod replication;
pub mod rpc;
pub mod snapshot;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;

use crate::config::{ClusterNode, Config};
use crate::error::VaultError;
use crate::metrics::{ConsensusMetrics, EventKind};
use crate::vault::{Command, KeyVault};
use self::log::RaftLog;
use self::persistence::{HardState, HardStateStore};
use self::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, Transport, VoteRequest, VoteResponse,
};
use self::snapshot::{Snapshot, SnapshotManager};
use self::state::{NodeRole, NodeState};

/// Everything the node mutex guards: volatile consensus state plus the
/// replicated log. Role transitions, term changes, and commit advancement
/// all happen while this is held.
pub struct NodeInner {
    pub state: NodeState,
    pub log: RaftLog,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub term: u64,
    pub log_index: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadView {
    pub value: Option<String>,
    pub found: bool,
    pub term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteProgress {
    Pending,
    Replicated,
    NotReplicated,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftStatus {
    pub node_id: String,
    pub role: NodeRole,
    pub term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied_index: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub snapshot_index: u64,
}

/// The consensus coordinator. One per process; owns the node state, the
/// log, the vault, and the durable stores, and drives elections,
/// replication, and application from its background tasks.
pub struct RaftNode {
    pub(crate) config: Arc<Config>,
    pub(crate) node_id: String,
    pub(crate) peers: Vec<ClusterNode>,
    pub(crate) majority: usize,
    pub(crate) inner: Mutex<NodeInner>,
    pub(crate) vault: RwLock<KeyVault>,
    pub(crate) hard_state: HardStateStore,
    pub(crate) snapshots: SnapshotManager,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) metrics: Arc<ConsensusMetrics>,
    pub(crate) apply_notify: Notify,
    pub(crate) shutdown: AtomicBool,
}

impl RaftNode {
    /// Builds the node and runs the recovery path: hard state, then the
    /// latest readable snapshot, then Follower.
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        metrics: Arc<ConsensusMetrics>,
    ) -> Result<Arc<Self>, VaultError> {
        let data_dir = &config.node.data_dir;
        let hard_state = HardStateStore::new(data_dir);
        let loaded = hard_state.load()?;
        let snapshots = SnapshotManager::new(
            data_dir,
            config.snapshot.retain_backups,
            config.snapshot.compress,
        );

        let mut vault = KeyVault::new();
        let mut log = RaftLog::new();
        let mut state = NodeState::new();
        state.current_term = loaded.current_term;
        state.voted_for = loaded.voted_for;
        state.election_deadline = Instant::now() + random_election_timeout(&config);

        if let Some(snapshot) = snapshots.load()? {
            info!(
                "recovering state machine from snapshot at index {}",
                snapshot.last_included_index
            );
            vault.restore(snapshot.state.clone());
            log.reset_to_snapshot(snapshot.last_included_index, snapshot.last_included_term);
            state.commit_index = snapshot.last_included_index;
            state.last_applied = snapshot.last_included_index;
        }

        info!(
            "node {} starting as follower at term {}",
            config.node.id, state.current_term
        );

        Ok(Arc::new(RaftNode {
            node_id: config.node.id.clone(),
            peers: config.peers(),
            majority: config.majority(),
            inner: Mutex::new(NodeInner { state, log }),
            vault: RwLock::new(vault),
            hard_state,
            snapshots,
            transport,
            metrics,
            apply_notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            config,
        }))
    }

    /// Starts the consensus tick loop and the applier task.
    pub fn start(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            node.consensus_loop().await;
        });
        let node = self.clone();
        tokio::spawn(async move {
            applier::run(node).await;
        });
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.apply_notify.notify_one();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// One loop drives both timers: the election deadline while follower
    /// or candidate, the heartbeat interval while leader.
    async fn consensus_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        let heartbeat_interval = self.config.heartbeat_interval();
        let mut last_heartbeat = Instant::now()
            .checked_sub(heartbeat_interval)
            .unwrap_or_else(Instant::now);

        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                break;
            }

            let (role, deadline) = {
                let inner = self.inner.lock().await;
                (inner.state.role, inner.state.election_deadline)
            };

            match role {
                NodeRole::Leader => {
                    if last_heartbeat.elapsed() >= heartbeat_interval {
                        last_heartbeat = Instant::now();
                        self.replicate_to_peers().await;
                    }
                }
                NodeRole::Follower | NodeRole::Candidate => {
                    if Instant::now() >= deadline {
                        self.start_election().await;
                        last_heartbeat = Instant::now();
                    }
                }
            }
        }
        info!("consensus loop stopped");
    }

    /// Election timer fired: become candidate, persist the vote for self,
    /// and solicit votes in parallel. Wins on the first response that
    /// reaches a strict majority of the configured cluster size.
    pub(crate) async fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut inner = self.inner.lock().await;
            let next_term = inner.state.current_term + 1;
            let hard = HardState {
                current_term: next_term,
                voted_for: Some(self.node_id.clone()),
            };
            if let Err(e) = self.hard_state.save(&hard) {
                error!("abandoning candidacy, could not persist vote: {}", e);
                self.reset_election_deadline_locked(&mut inner);
                return;
            }
            inner.state.current_term = next_term;
            inner.state.voted_for = Some(self.node_id.clone());
            inner.state.role = NodeRole::Candidate;
            inner.state.leader_id = None;
            self.reset_election_deadline_locked(&mut inner);
            (next_term, inner.log.last_index(), inner.log.last_term())
        };

        info!("election timeout, campaigning for term {}", term);
        self.metrics.record(EventKind::ElectionStarted, term, "election timer fired").await;

        let mut granted = 1usize; // self-vote
        if granted >= self.majority {
            self.become_leader(term).await;
            return;
        }

        let request = VoteRequest {
            term,
            candidate_id: self.node_id.clone(),
            last_log_index,
            last_log_term,
        };
        let mut pending: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|peer| {
                let transport = self.transport.clone();
                let request = request.clone();
                let peer = peer.clone();
                async move {
                    let result = transport.request_vote(&peer, &request).await;
                    (peer.id, result)
                }
            })
            .collect();

        while let Some((peer_id, result)) = pending.next().await {
            match result {
                Ok(response) => {
                    let mut inner = self.inner.lock().await;
                    // A stale response for a past candidacy is discarded.
                    if inner.state.current_term != term || inner.state.role != NodeRole::Candidate
                    {
                        return;
                    }
                    if response.term > term {
                        if let Err(e) = self.observe_higher_term(&mut inner, response.term).await {
                            error!("failed to persist higher term: {}", e);
                        }
                        return;
                    }
                    if response.vote_granted {
                        granted += 1;
                        debug!("vote granted by {} ({}/{})", peer_id, granted, self.majority);
                        if granted >= self.majority {
                            drop(inner);
                            self.become_leader(term).await;
                            return;
                        }
                    }
                }
                Err(e) => debug!("vote request to {} failed: {}", peer_id, e),
            }
        }

        debug!(
            "election for term {} ended without a majority ({} votes)",
            term, granted
        );
    }

    async fn become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.current_term != term || inner.state.role != NodeRole::Candidate {
                return;
            }
            inner.state.role = NodeRole::Leader;
            inner.state.leader_id = Some(self.node_id.clone());
            let last_index = inner.log.last_index();
            inner.state.begin_leadership(&self.peers, last_index);

            // A no-op at the new term lets earlier-term entries commit
            // once it is replicated.
            let noop_index = inner.log.append_command(term, Command::NoOp);
            debug!("appended no-op at index {}", noop_index);
            self.try_advance_commit_locked(&mut inner);

            info!("won election, leading term {}", term);
        }
        self.metrics.record(EventKind::LeaderElected, term, "majority reached").await;
        self.replicate_to_peers().await;
    }

    /// Adopts a higher term observed in any RPC. Persists before the new
    /// term is visible anywhere; the caller's operation continues as
    /// Follower.
    pub(crate) async fn observe_higher_term(
        &self,
        inner: &mut NodeInner,
        term: u64,
    ) -> Result<(), VaultError> {
        self.hard_state.save(&HardState { current_term: term, voted_for: None })?;
        let was_leader = inner.state.role == NodeRole::Leader;
        inner.state.current_term = term;
        inner.state.voted_for = None;
        inner.state.leader_id = None;
        self.become_follower_locked(inner);
        if was_leader {
            warn!("observed term {}, stepping down from leader", term);
            self.metrics.record(EventKind::SteppedDown, term, "higher term observed").await;
        }
        Ok(())
    }

    pub(crate) fn become_follower_locked(&self, inner: &mut NodeInner) {
        inner.state.role = NodeRole::Follower;
        inner.state.end_leadership();
        self.reset_election_deadline_locked(inner);
    }

    pub(crate) fn reset_election_deadline_locked(&self, inner: &mut NodeInner) {
        inner.state.election_deadline = Instant::now() + random_election_timeout(&self.config);
    }

    /// RequestVote receiver. The vote is fsynced before the response is
    /// emitted.
    pub async fn handle_request_vote(
        &self,
        request: VoteRequest,
    ) -> Result<VoteResponse, VaultError> {
        let mut inner = self.inner.lock().await;

        // Reply false if term < currentTerm
        if request.term < inner.state.current_term {
            return Ok(VoteResponse { term: inner.state.current_term, vote_granted: false });
        }

        let term_advanced = request.term > inner.state.current_term;
        let prior_vote = if term_advanced { None } else { inner.state.voted_for.clone() };

        let can_vote = prior_vote.is_none()
            || prior_vote.as_deref() == Some(request.candidate_id.as_str());
        // Candidate's log must be at least as up-to-date as ours.
        let log_ok = (request.last_log_term, request.last_log_index)
            >= (inner.log.last_term(), inner.log.last_index());
        let grant = can_vote && log_ok;

        let voted_for = if grant { Some(request.candidate_id.clone()) } else { prior_vote };
        if term_advanced || voted_for != inner.state.voted_for {
            self.hard_state
                .save(&HardState { current_term: request.term, voted_for: voted_for.clone() })?;
        }
        if term_advanced {
            inner.state.current_term = request.term;
            inner.state.leader_id = None;
            self.become_follower_locked(&mut inner);
        }
        inner.state.voted_for = voted_for;

        if grant {
            debug!(
                "granting vote to {} for term {}",
                request.candidate_id, request.term
            );
            self.reset_election_deadline_locked(&mut inner);
            self.metrics
                .record(EventKind::VoteGranted, request.term, request.candidate_id.clone())
                .await;
        }

        Ok(VoteResponse { term: inner.state.current_term, vote_granted: grant })
    }

    /// AppendEntries receiver: heartbeat, replication, and log repair in
    /// one. See `RaftLog::resolve` for the idempotent append rule.
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, VaultError> {
        self.metrics.append_entries_received();
        let mut inner = self.inner.lock().await;

        // Reply false if term < currentTerm
        if request.term < inner.state.current_term {
            return Ok(reject_append(&inner, 0));
        }
        if request.term > inner.state.current_term {
            self.observe_higher_term(&mut inner, request.term).await?;
        } else if inner.state.role != NodeRole::Follower {
            // A valid leader exists for our term.
            self.become_follower_locked(&mut inner);
        }

        inner.state.leader_id = Some(request.leader_id.clone());
        self.reset_election_deadline_locked(&mut inner);

        // The entry at prevLogIndex must match prevLogTerm. Indices at or
        // below our snapshot are committed and match by definition.
        let prev_ok = request.prev_log_index <= inner.log.snapshot_index()
            || inner.log.term_at(request.prev_log_index) == Some(request.prev_log_term);
        if !prev_ok {
            let conflict_index = if request.prev_log_index > inner.log.last_index() {
                inner.log.last_index() + 1
            } else {
                inner.log.first_index_of_term(request.prev_log_index)
            };
            debug!(
                "rejecting append from {}: no match at prev index {} (hint {})",
                request.leader_id, request.prev_log_index, conflict_index
            );
            self.metrics
                .record(EventKind::AppendRejected, request.term, request.leader_id.clone())
                .await;
            return Ok(reject_append(&inner, conflict_index));
        }

        inner.log.resolve(request.entries);

        if request.leader_commit > inner.state.commit_index {
            inner.state.commit_index = request.leader_commit.min(inner.log.last_index());
            self.apply_notify.notify_one();
        }

        Ok(AppendEntriesResponse {
            term: inner.state.current_term,
            success: true,
            match_index: inner.log.last_index(),
            last_log_index: inner.log.last_index(),
            last_log_term: inner.log.last_term(),
            conflict_index: 0,
        })
    }

    /// InstallSnapshot receiver. Only the final chunk installs; the state
    /// machine is replaced wholesale and the log keeps its tail only when
    /// it agrees with the snapshot boundary.
    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, VaultError> {
        let mut inner = self.inner.lock().await;

        if request.term < inner.state.current_term {
            return Ok(InstallSnapshotResponse { term: inner.state.current_term });
        }
        if request.term > inner.state.current_term {
            self.observe_higher_term(&mut inner, request.term).await?;
        } else if inner.state.role != NodeRole::Follower {
            self.become_follower_locked(&mut inner);
        }
        inner.state.leader_id = Some(request.leader_id.clone());
        self.reset_election_deadline_locked(&mut inner);

        if !request.done {
            return Ok(InstallSnapshotResponse { term: inner.state.current_term });
        }
        if request.last_included_index <= inner.log.snapshot_index() {
            debug!(
                "ignoring stale snapshot at index {}",
                request.last_included_index
            );
            return Ok(InstallSnapshotResponse { term: inner.state.current_term });
        }

        info!(
            "installing snapshot at index {} from {}",
            request.last_included_index, request.leader_id
        );

        let snapshot = Snapshot {
            last_included_index: request.last_included_index,
            last_included_term: request.last_included_term,
            term_at_creation: request.term,
            created_at: chrono::Utc::now(),
            state: request.data.clone(),
        };
        // Durable before anything in memory changes.
        self.snapshots.persist(&snapshot)?;

        {
            let mut vault = self.vault.write().await;
            vault.restore(request.data);
        }

        if inner.log.term_at(request.last_included_index) == Some(request.last_included_term) {
            // Local tail agrees with the snapshot boundary; keep it and
            // replay it against the replaced state machine.
            inner.log.compact(request.last_included_index, request.last_included_term);
            inner.log.reset_applied_above(request.last_included_index);
        } else {
            inner.log.reset_to_snapshot(request.last_included_index, request.last_included_term);
        }

        inner.state.commit_index = inner.state.commit_index.max(request.last_included_index);
        inner.state.last_applied = request.last_included_index;
        self.apply_notify.notify_one();

        self.metrics
            .record(EventKind::SnapshotInstalled, request.term, request.leader_id.clone())
            .await;
        Ok(InstallSnapshotResponse { term: inner.state.current_term })
    }

    /// Leader-only write path: appends to the log and returns immediately.
    /// The entry is committed once a majority acknowledges it. Command
    /// validation happens at the applier; a bad command is still accepted
    /// here and skipped there.
    pub async fn propose(&self, command: Command) -> Result<WriteReceipt, VaultError> {
        let mut inner = self.inner.lock().await;
        if inner.state.role != NodeRole::Leader {
            return Err(VaultError::NotLeader { leader: inner.state.leader_id.clone() });
        }
        let term = inner.state.current_term;
        let log_index = inner.log.append_command(term, command);
        debug!("accepted write at index {} in term {}", log_index, term);
        // Covers the single-node cluster, where the quorum is just us.
        self.try_advance_commit_locked(&mut inner);
        Ok(WriteReceipt { term, log_index })
    }

    /// Leader-only read, served from the local state machine. This is the
    /// documented weaker guarantee: read-your-writes from a stable leader,
    /// with a stale window across leadership changes.
    pub async fn read(&self, key: &str) -> Result<ReadView, VaultError> {
        let (term, leader_id, commit_index, last_applied_index) = {
            let inner = self.inner.lock().await;
            if inner.state.role != NodeRole::Leader {
                return Err(VaultError::NotLeader { leader: inner.state.leader_id.clone() });
            }
            (
                inner.state.current_term,
                inner.state.leader_id.clone(),
                inner.state.commit_index,
                inner.state.last_applied,
            )
        };
        let value = self.vault.read().await.get(key);
        Ok(ReadView {
            found: value.is_some(),
            value,
            term,
            leader_id,
            commit_index,
            last_applied_index,
        })
    }

    /// Full map dump, leader-only. Debug surface.
    pub async fn dump_all(&self) -> Result<std::collections::HashMap<String, String>, VaultError> {
        {
            let inner = self.inner.lock().await;
            if inner.state.role != NodeRole::Leader {
                return Err(VaultError::NotLeader { leader: inner.state.leader_id.clone() });
            }
        }
        Ok(self.vault.read().await.all())
    }

    /// Progress of a previously accepted write. With the accepting term
    /// supplied, a lost entry (overwritten after a leader change) is
    /// reported as NOT_REPLICATED rather than silently renumbered.
    pub async fn write_status(
        &self,
        log_index: u64,
        accepted_term: Option<u64>,
    ) -> Result<WriteProgress, VaultError> {
        let inner = self.inner.lock().await;
        if inner.state.role != NodeRole::Leader {
            return Err(VaultError::NotLeader { leader: inner.state.leader_id.clone() });
        }

        if let Some(term) = accepted_term {
            if log_index <= inner.log.snapshot_index() {
                return Ok(WriteProgress::Replicated);
            }
            return Ok(match inner.log.term_at(log_index) {
                Some(actual) if actual == term => {
                    if log_index <= inner.state.commit_index {
                        WriteProgress::Replicated
                    } else {
                        WriteProgress::Pending
                    }
                }
                _ => WriteProgress::NotReplicated,
            });
        }

        Ok(if log_index <= inner.state.commit_index {
            WriteProgress::Replicated
        } else if log_index <= inner.log.last_index() {
            WriteProgress::Pending
        } else {
            WriteProgress::NotReplicated
        })
    }

    pub async fn status(&self) -> RaftStatus {
        let inner = self.inner.lock().await;
        RaftStatus {
            node_id: self.node_id.clone(),
            role: inner.state.role,
            term: inner.state.current_term,
            leader_id: inner.state.leader_id.clone(),
            commit_index: inner.state.commit_index,
            last_applied_index: inner.state.last_applied,
            last_log_index: inner.log.last_index(),
            last_log_term: inner.log.last_term(),
            snapshot_index: inner.log.snapshot_index(),
        }
    }
}

fn reject_append(inner: &NodeInner, conflict_index: u64) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term: inner.state.current_term,
        success: false,
        match_index: 0,
        last_log_index: inner.log.last_index(),
        last_log_term: inner.log.last_term(),
        conflict_index,
    }
}

fn random_election_timeout(config: &Config) -> Duration {
    let ms = rand::thread_rng().gen_range(
        config.raft.election_timeout_min_ms..=config.raft.election_timeout_max_ms,
    );
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::LogEntry;
    use crate::raft::testutil::{make_cluster, make_node};

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, Command::NoOp)
    }

    fn append_request(
        term: u64,
        leader: &str,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: leader.to_string(),
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            leader_commit,
        }
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1"]).await;
        let node = &nodes[0];

        node.start_election().await;
        let status = node.status().await;
        assert_eq!(status.role, NodeRole::Leader);
        assert_eq!(status.term, 1);
        // The no-op commits on the self-quorum.
        assert_eq!(status.commit_index, 1);

        let receipt = node
            .propose(Command::Put { key: "a".to_string(), value: "1".to_string() })
            .await
            .unwrap();
        assert_eq!(receipt.log_index, 2);
        node.apply_committed().await;

        let view = node.read("a").await.unwrap();
        assert!(view.found);
        assert_eq!(view.value.as_deref(), Some("1"));
        assert!(view.last_applied_index >= 2);
    }

    #[tokio::test]
    async fn test_vote_denied_for_stale_term() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];
        {
            let mut inner = node.inner.lock().await;
            inner.state.current_term = 5;
        }

        let response = node
            .handle_request_vote(VoteRequest {
                term: 3,
                candidate_id: "node-2".to_string(),
                last_log_index: 10,
                last_log_term: 3,
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);
        assert_eq!(response.term, 5);
    }

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];

        let first = node
            .handle_request_vote(VoteRequest {
                term: 1,
                candidate_id: "node-2".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(first.vote_granted);

        // A different candidate in the same term is refused.
        let second = node
            .handle_request_vote(VoteRequest {
                term: 1,
                candidate_id: "node-3".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(!second.vote_granted);

        // The same candidate retrying is granted again.
        let retry = node
            .handle_request_vote(VoteRequest {
                term: 1,
                candidate_id: "node-2".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(retry.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_denied_to_outdated_log() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];
        node.handle_append_entries(append_request(
            2,
            "node-3",
            0,
            0,
            vec![entry(1, 1), entry(2, 2)],
            0,
        ))
        .await
        .unwrap();

        // Same last term, shorter log: denied.
        let response = node
            .handle_request_vote(VoteRequest {
                term: 3,
                candidate_id: "node-2".to_string(),
                last_log_index: 1,
                last_log_term: 2,
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);
        // Term was still adopted.
        assert_eq!(response.term, 3);

        // Higher last term wins regardless of length.
        let response = node
            .handle_request_vote(VoteRequest {
                term: 4,
                candidate_id: "node-2".to_string(),
                last_log_index: 1,
                last_log_term: 3,
            })
            .await
            .unwrap();
        assert!(response.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_persisted_across_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let (node, _net) =
                make_node("node-1", &["node-1", "node-2", "node-3"], dir.path()).await;
            node.handle_request_vote(VoteRequest {
                term: 7,
                candidate_id: "node-2".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        }

        let (revived, _net) =
            make_node("node-1", &["node-1", "node-2", "node-3"], dir.path()).await;
        let inner = revived.inner.lock().await;
        assert_eq!(inner.state.current_term, 7);
        assert_eq!(inner.state.voted_for.as_deref(), Some("node-2"));
    }

    #[tokio::test]
    async fn test_append_rejects_stale_term() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];
        {
            let mut inner = node.inner.lock().await;
            inner.state.current_term = 4;
        }

        let response = node
            .handle_append_entries(append_request(3, "node-2", 0, 0, vec![], 0))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.term, 4);
    }

    #[tokio::test]
    async fn test_append_conflict_hint_when_behind() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];

        // Leader assumes we hold 5 entries; we hold none.
        let response = node
            .handle_append_entries(append_request(1, "node-2", 5, 1, vec![entry(6, 1)], 0))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.conflict_index, 1);
    }

    #[tokio::test]
    async fn test_append_conflict_hint_on_term_divergence() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];
        // Stale tail: [(1,1), (2,2), (3,2)].
        node.handle_append_entries(append_request(
            2,
            "node-2",
            0,
            0,
            vec![entry(1, 1), entry(2, 2), entry(3, 2)],
            0,
        ))
        .await
        .unwrap();

        // New leader at term 3 probes with prev (3, 3): mismatch, and the
        // hint points at the start of our term-2 run.
        let response = node
            .handle_append_entries(append_request(3, "node-3", 3, 3, vec![], 0))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.conflict_index, 2);
    }

    #[tokio::test]
    async fn test_append_truncates_conflicting_suffix() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];
        node.handle_append_entries(append_request(
            2,
            "node-2",
            0,
            0,
            vec![entry(1, 1), entry(2, 1), entry(3, 2)],
            0,
        ))
        .await
        .unwrap();

        // The new leader replaces entry 3 and extends.
        let response = node
            .handle_append_entries(append_request(
                3,
                "node-3",
                2,
                1,
                vec![entry(3, 3), entry(4, 3)],
                0,
            ))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, 4);

        let inner = node.inner.lock().await;
        assert_eq!(inner.log.term_at(3), Some(3));
        assert_eq!(inner.log.term_at(4), Some(3));
    }

    #[tokio::test]
    async fn test_append_is_idempotent_on_retry() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];
        let request = append_request(1, "node-2", 0, 0, vec![entry(1, 1), entry(2, 1)], 0);

        let first = node.handle_append_entries(request.clone()).await.unwrap();
        let second = node.handle_append_entries(request).await.unwrap();
        assert!(first.success && second.success);
        assert_eq!(second.match_index, 2);

        let inner = node.inner.lock().await;
        assert_eq!(inner.log.last_index(), 2);
    }

    #[tokio::test]
    async fn test_append_updates_commit_index() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];

        let response = node
            .handle_append_entries(append_request(
                1,
                "node-2",
                0,
                0,
                vec![entry(1, 1), entry(2, 1)],
                5, // leader is ahead of what we hold
            ))
            .await
            .unwrap();
        assert!(response.success);

        let inner = node.inner.lock().await;
        // Clamped to our last index.
        assert_eq!(inner.state.commit_index, 2);
    }

    #[tokio::test]
    async fn test_candidate_steps_down_on_current_term_leader() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];
        {
            let mut inner = node.inner.lock().await;
            inner.state.current_term = 2;
            inner.state.role = NodeRole::Candidate;
        }

        let response = node
            .handle_append_entries(append_request(2, "node-2", 0, 0, vec![], 0))
            .await
            .unwrap();
        assert!(response.success);

        let status = node.status().await;
        assert_eq!(status.role, NodeRole::Follower);
        assert_eq!(status.leader_id.as_deref(), Some("node-2"));
    }

    #[tokio::test]
    async fn test_leader_steps_down_on_higher_term_append() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1"]).await;
        let node = &nodes[0];
        node.start_election().await;
        assert_eq!(node.status().await.role, NodeRole::Leader);

        let response = node
            .handle_append_entries(append_request(9, "node-9", 0, 0, vec![], 0))
            .await
            .unwrap();
        assert!(response.success);

        let status = node.status().await;
        assert_eq!(status.role, NodeRole::Follower);
        assert_eq!(status.term, 9);

        let inner = node.inner.lock().await;
        assert!(inner.state.next_index.is_empty());
    }

    #[tokio::test]
    async fn test_three_node_election() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;

        nodes[0].start_election().await;

        let status = nodes[0].status().await;
        assert_eq!(status.role, NodeRole::Leader);
        assert_eq!(status.term, 1);

        // The initial heartbeat carried the new term to both followers.
        for follower in &nodes[1..] {
            let inner = follower.inner.lock().await;
            assert_eq!(inner.state.current_term, 1);
            assert_eq!(inner.state.leader_id.as_deref(), Some("node-1"));
            assert_eq!(inner.state.role, NodeRole::Follower);
        }
    }

    #[tokio::test]
    async fn test_election_safety_one_leader_per_term() {
        let (net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;

        nodes[0].start_election().await;
        assert_eq!(nodes[0].status().await.role, NodeRole::Leader);
        let term = nodes[0].status().await.term;

        // A rival campaigning in the same cluster raises the term, so it
        // can never win the term the first leader holds.
        net.set_down("node-1", true);
        nodes[1].start_election().await;
        let rival = nodes[1].status().await;
        assert!(rival.term > term);
        if rival.role == NodeRole::Leader {
            assert_ne!(rival.term, term);
        }
    }

    #[tokio::test]
    async fn test_leader_crash_triggers_new_leader_at_higher_term() {
        let (net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;

        nodes[0].start_election().await;
        nodes[0].replicate_to_peers().await;
        let old_term = nodes[0].status().await.term;

        // Leader drops off the network; a follower campaigns.
        net.set_down("node-1", true);
        nodes[1].start_election().await;

        let status = nodes[1].status().await;
        assert_eq!(status.role, NodeRole::Leader);
        assert!(status.term > old_term);

        // Writes succeed against the new leader.
        let receipt = nodes[1]
            .propose(Command::Put { key: "k".to_string(), value: "v".to_string() })
            .await
            .unwrap();
        nodes[1].replicate_to_peers().await;
        assert!(nodes[1].status().await.commit_index >= receipt.log_index);
    }

    #[tokio::test]
    async fn test_split_vote_recovers_next_round() {
        let (net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;

        // Isolate both would-be candidates so neither reaches a majority.
        net.set_down("node-2", true);
        net.set_down("node-3", true);
        nodes[0].start_election().await;
        assert_eq!(nodes[0].status().await.role, NodeRole::Candidate);

        // Network heals; the next round elects.
        net.set_down("node-2", false);
        net.set_down("node-3", false);
        nodes[0].start_election().await;
        assert_eq!(nodes[0].status().await.role, NodeRole::Leader);
        assert_eq!(nodes[0].status().await.term, 2);
    }

    #[tokio::test]
    async fn test_follower_rejects_client_traffic() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        nodes[0].start_election().await;
        nodes[0].replicate_to_peers().await;

        let follower = &nodes[1];
        let write = follower
            .propose(Command::Put { key: "a".to_string(), value: "1".to_string() })
            .await;
        match write {
            Err(VaultError::NotLeader { leader }) => {
                assert_eq!(leader.as_deref(), Some("node-1"))
            }
            other => panic!("expected NotLeader, got {:?}", other.map(|r| r.log_index)),
        }
        assert!(matches!(
            follower.read("a").await,
            Err(VaultError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_status_reports_progress() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1"]).await;
        let node = &nodes[0];
        node.start_election().await;

        let receipt = node
            .propose(Command::Put { key: "a".to_string(), value: "1".to_string() })
            .await
            .unwrap();
        assert_eq!(
            node.write_status(receipt.log_index, Some(receipt.term)).await.unwrap(),
            WriteProgress::Replicated
        );
        assert_eq!(
            node.write_status(receipt.log_index + 5, None).await.unwrap(),
            WriteProgress::NotReplicated
        );
        // A different accepting term means the write was lost.
        assert_eq!(
            node.write_status(receipt.log_index, Some(receipt.term + 1)).await.unwrap(),
            WriteProgress::NotReplicated
        );
    }

    #[tokio::test]
    async fn test_term_never_decreases() {
        let (_net, nodes, _dirs) = make_cluster(&["node-1", "node-2", "node-3"]).await;
        let node = &nodes[0];

        node.handle_append_entries(append_request(5, "node-2", 0, 0, vec![], 0))
            .await
            .unwrap();
        assert_eq!(node.status().await.term, 5);

        // Stale traffic cannot lower it.
        node.handle_append_entries(append_request(2, "node-3", 0, 0, vec![], 0))
            .await
            .unwrap();
        node.handle_request_vote(VoteRequest {
            term: 1,
            candidate_id: "node-3".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        })
        .await
        .unwrap();
        assert_eq!(node.status().await.term, 5);
    }
}
