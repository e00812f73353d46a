use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::VaultError;
use crate::metrics::EventKind;
use crate::raft::snapshot::Snapshot;
use crate::raft::RaftNode;

/// Applier task: wakes on commit-index changes, applies committed entries
/// to the vault in strict index order, and checks snapshot eligibility
/// afterwards. Replication and elections never wait on it.
pub(crate) async fn run(node: Arc<RaftNode>) {
    loop {
        node.apply_notify.notified().await;
        if node.is_shutdown() {
            break;
        }
        node.apply_committed().await;
        if let Err(e) = node.maybe_snapshot().await {
            warn!("snapshot attempt failed: {}", e);
        }
    }
    info!("applier stopped");
}

impl RaftNode {
    /// Applies every committed-but-unapplied entry. Each entry is applied
    /// at most once per process lifetime; invalid commands are logged and
    /// skipped so `last_applied` still advances past them.
    pub(crate) async fn apply_committed(&self) {
        loop {
            let (batch, commit_seen) = {
                let inner = self.inner.lock().await;
                if inner.state.last_applied >= inner.state.commit_index {
                    return;
                }
                (
                    inner.log.unapplied_range(inner.state.last_applied, inner.state.commit_index),
                    inner.state.commit_index,
                )
            };
            let Some(highest) = batch.last().map(|e| e.index) else {
                // Everything up to the commit point we saw already carried
                // the applied flag.
                let mut inner = self.inner.lock().await;
                if commit_seen > inner.state.last_applied {
                    inner.state.last_applied = commit_seen;
                }
                continue;
            };

            {
                let mut vault = self.vault.write().await;
                for entry in &batch {
                    match vault.apply(&entry.command) {
                        Ok(()) => {}
                        Err(e) => {
                            warn!("skipping entry {}: {}", entry.index, e);
                            self.metrics.command_skipped();
                        }
                    }
                }
            }

            let mut inner = self.inner.lock().await;
            for entry in &batch {
                inner.log.mark_applied(entry.index);
            }
            if highest > inner.state.last_applied {
                let applied = highest - inner.state.last_applied;
                inner.state.last_applied = highest;
                self.metrics.entries_applied(applied);
                debug!("applied through index {}", highest);
            }
        }
    }

    /// Compaction trigger: snapshot once the applied range beyond the
    /// current snapshot exceeds the configured threshold.
    pub(crate) async fn maybe_snapshot(&self) -> Result<(), VaultError> {
        let due = {
            let inner = self.inner.lock().await;
            inner.state.last_applied - inner.log.snapshot_index() > self.config.snapshot.threshold
        };
        if due {
            self.create_snapshot().await?;
        }
        Ok(())
    }

    /// Captures the state machine at `last_applied`, persists it durably,
    /// then compacts the log. Also the manual /snapshots/create path.
    pub async fn create_snapshot(&self) -> Result<Snapshot, VaultError> {
        let snapshot = {
            let inner = self.inner.lock().await;
            let last_applied = inner.state.last_applied;
            if last_applied <= inner.log.snapshot_index() {
                return Err(VaultError::Snapshot(
                    "no applied entries beyond the current snapshot".to_string(),
                ));
            }
            let Some(last_included_term) = inner.log.term_at(last_applied) else {
                return Err(VaultError::Snapshot(format!(
                    "term for applied index {} is not available",
                    last_applied
                )));
            };
            let state = self.vault.read().await.export();
            Snapshot {
                last_included_index: last_applied,
                last_included_term,
                term_at_creation: inner.state.current_term,
                created_at: chrono::Utc::now(),
                state,
            }
        };

        if let Err(e) = self.snapshots.persist(&snapshot) {
            // The log must not be compacted past state that never hit disk.
            error!("snapshot persistence failed, keeping log intact: {}", e);
            return Err(e);
        }

        {
            let mut inner = self.inner.lock().await;
            if snapshot.last_included_index > inner.log.snapshot_index() {
                inner.log.compact(snapshot.last_included_index, snapshot.last_included_term);
            }
        }

        info!(
            "log compacted through index {}",
            snapshot.last_included_index
        );
        self.metrics
            .record(
                EventKind::SnapshotCreated,
                snapshot.term_at_creation,
                format!("index {}", snapshot.last_included_index),
            )
            .await;
        Ok(snapshot)
    }
}
