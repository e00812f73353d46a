use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ClusterNode;
use crate::raft::rpc::{AppendEntriesRequest, InstallSnapshotRequest};
use crate::raft::state::NodeRole;
use crate::raft::{NodeInner, RaftNode};

enum PeerCall {
    Append { request: AppendEntriesRequest, sent_next: u64 },
    Install { request: InstallSnapshotRequest },
}

impl RaftNode {
    /// One heartbeat round: every peer gets an AppendEntries carrying
    /// whatever its `next_index` owes it (possibly nothing), or an
    /// InstallSnapshot when its `next_index` has been compacted away.
    pub(crate) async fn replicate_to_peers(self: &Arc<Self>) {
        let calls: Vec<(ClusterNode, PeerCall)> = {
            let inner = self.inner.lock().await;
            if inner.state.role != NodeRole::Leader {
                return;
            }
            let term = inner.state.current_term;
            self.peers
                .iter()
                .filter_map(|peer| self.build_call(&inner, peer, term).map(|c| (peer.clone(), c)))
                .collect()
        };

        let round = calls.into_iter().map(|(peer, call)| async move {
            match call {
                PeerCall::Append { request, sent_next } => {
                    self.send_append(&peer, request, sent_next).await;
                }
                PeerCall::Install { request } => {
                    self.send_install(&peer, request).await;
                }
            }
        });
        futures::future::join_all(round).await;
    }

    fn build_call(&self, inner: &NodeInner, peer: &ClusterNode, term: u64) -> Option<PeerCall> {
        let next = inner
            .state
            .next_index
            .get(&peer.id)
            .copied()
            .unwrap_or(inner.log.last_index() + 1);

        if next <= inner.log.snapshot_index() {
            // The entries this peer needs are gone; ship the snapshot.
            let Some(snapshot) = self.snapshots.current() else {
                warn!(
                    "peer {} needs index {} but no snapshot is loaded",
                    peer.id, next
                );
                return None;
            };
            return Some(PeerCall::Install {
                request: InstallSnapshotRequest {
                    term,
                    leader_id: self.node_id.clone(),
                    last_included_index: snapshot.last_included_index,
                    last_included_term: snapshot.last_included_term,
                    offset: 0,
                    data: snapshot.state,
                    done: true,
                },
            });
        }

        let prev_log_index = next - 1;
        let prev_log_term = inner.log.term_at(prev_log_index).unwrap_or(0);
        let entries = inner.log.slice_from(next, self.config.raft.max_entries_per_append);
        Some(PeerCall::Append {
            sent_next: next,
            request: AppendEntriesRequest {
                term,
                leader_id: self.node_id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: inner.state.commit_index,
            },
        })
    }

    async fn send_append(
        self: &Arc<Self>,
        peer: &ClusterNode,
        request: AppendEntriesRequest,
        sent_next: u64,
    ) {
        let term = request.term;
        match self.transport.append_entries(peer, &request).await {
            Ok(response) => {
                let mut inner = self.inner.lock().await;
                // The reply belongs to this term's leadership or not at all.
                if inner.state.role != NodeRole::Leader || inner.state.current_term != term {
                    return;
                }
                if response.term > term {
                    if let Err(e) = self.observe_higher_term(&mut inner, response.term).await {
                        warn!("failed to persist higher term: {}", e);
                    }
                    return;
                }
                if response.success {
                    let acknowledged = response.match_index.min(inner.log.last_index());
                    let match_entry =
                        inner.state.match_index.entry(peer.id.clone()).or_insert(0);
                    if acknowledged > *match_entry {
                        *match_entry = acknowledged;
                    }
                    let matched = *match_entry;
                    inner.state.next_index.insert(peer.id.clone(), matched + 1);
                    self.try_advance_commit_locked(&mut inner);
                } else {
                    // Ignore replies obsoleted by a later adjustment.
                    let current_next =
                        inner.state.next_index.get(&peer.id).copied().unwrap_or(1);
                    if current_next != sent_next {
                        return;
                    }
                    let mut new_next = if response.conflict_index > 0 {
                        response.conflict_index
                    } else {
                        sent_next.saturating_sub(1)
                    };
                    if new_next >= sent_next {
                        new_next = sent_next.saturating_sub(1);
                    }
                    inner.state.next_index.insert(peer.id.clone(), new_next.max(1));
                    debug!(
                        "peer {} rejected append, backing next_index off to {}",
                        peer.id,
                        new_next.max(1)
                    );
                }
            }
            Err(e) => {
                // Transient; the next heartbeat tick retries.
                debug!("append entries to {} failed: {}", peer.id, e);
            }
        }
    }

    async fn send_install(self: &Arc<Self>, peer: &ClusterNode, request: InstallSnapshotRequest) {
        let term = request.term;
        let last_included = request.last_included_index;
        match self.transport.install_snapshot(peer, &request).await {
            Ok(response) => {
                let mut inner = self.inner.lock().await;
                if inner.state.role != NodeRole::Leader || inner.state.current_term != term {
                    return;
                }
                if response.term > term {
                    if let Err(e) = self.observe_higher_term(&mut inner, response.term).await {
                        warn!("failed to persist higher term: {}", e);
                    }
                    return;
                }
                let match_entry = inner.state.match_index.entry(peer.id.clone()).or_insert(0);
                if last_included > *match_entry {
                    *match_entry = last_included;
                }
                inner.state.next_index.insert(peer.id.clone(), last_included + 1);
                debug!(
                    "peer {} caught up to snapshot index {}",
                    peer.id, last_included
                );
                self.try_advance_commit_locked(&mut inner);
            }
            Err(e) => {
                debug!("install snapshot to {} failed: {}", peer.id, e);
            }
        }
    }

    /// Advances the commit index to the largest N replicated on a strict
    /// majority whose entry carries the current term. Entries from prior
    /// terms commit only under such an N.
    pub(crate) fn try_advance_commit_locked(&self, inner: &mut NodeInner) {
        if inner.state.role != NodeRole::Leader {
            return;
        }
        let mut indexes: Vec<u64> = self
            .peers
            .iter()
            .map(|p| inner.state.match_index.get(&p.id).copied().unwrap_or(0))
            .collect();
        indexes.push(inner.log.last_index());
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_watermark = indexes[self.majority - 1];

        let mut n = quorum_watermark;
        while n > inner.state.commit_index {
            if inner.log.term_at(n) == Some(inner.state.current_term) {
                let advanced = n - inner.state.commit_index;
                inner.state.commit_index = n;
                self.metrics.entries_committed(advanced);
                debug!("commit index advanced to {}", n);
                self.apply_notify.notify_one();
                break;
            }
            n -= 1;
        }
    }
}
