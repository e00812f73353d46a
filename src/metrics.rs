use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ElectionStarted,
    LeaderElected,
    SteppedDown,
    VoteGranted,
    AppendRejected,
    SnapshotCreated,
    SnapshotInstalled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub term: u64,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub elections_started: u64,
    pub elections_won: u64,
    pub step_downs: u64,
    pub votes_granted: u64,
    pub append_entries_received: u64,
    pub append_entries_rejected: u64,
    pub entries_committed: u64,
    pub entries_applied: u64,
    pub commands_skipped: u64,
    pub snapshots_created: u64,
    pub snapshots_installed: u64,
    pub events_buffered: usize,
}

/// Consensus counters plus a bounded ring buffer of recent events for the
/// /metrics endpoints. Counters are atomics; the ring takes a short write
/// lock per event.
pub struct ConsensusMetrics {
    elections_started: AtomicU64,
    elections_won: AtomicU64,
    step_downs: AtomicU64,
    votes_granted: AtomicU64,
    append_entries_received: AtomicU64,
    append_entries_rejected: AtomicU64,
    entries_committed: AtomicU64,
    entries_applied: AtomicU64,
    commands_skipped: AtomicU64,
    snapshots_created: AtomicU64,
    snapshots_installed: AtomicU64,
    start_time: Instant,
    capacity: usize,
    events: RwLock<VecDeque<MetricEvent>>,
}

impl ConsensusMetrics {
    pub fn new(capacity: usize) -> Self {
        ConsensusMetrics {
            elections_started: AtomicU64::new(0),
            elections_won: AtomicU64::new(0),
            step_downs: AtomicU64::new(0),
            votes_granted: AtomicU64::new(0),
            append_entries_received: AtomicU64::new(0),
            append_entries_rejected: AtomicU64::new(0),
            entries_committed: AtomicU64::new(0),
            entries_applied: AtomicU64::new(0),
            commands_skipped: AtomicU64::new(0),
            snapshots_created: AtomicU64::new(0),
            snapshots_installed: AtomicU64::new(0),
            start_time: Instant::now(),
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, kind: EventKind, term: u64, detail: impl Into<String>) {
        match kind {
            EventKind::ElectionStarted => self.elections_started.fetch_add(1, Ordering::Relaxed),
            EventKind::LeaderElected => self.elections_won.fetch_add(1, Ordering::Relaxed),
            EventKind::SteppedDown => self.step_downs.fetch_add(1, Ordering::Relaxed),
            EventKind::VoteGranted => self.votes_granted.fetch_add(1, Ordering::Relaxed),
            EventKind::AppendRejected => self.append_entries_rejected.fetch_add(1, Ordering::Relaxed),
            EventKind::SnapshotCreated => self.snapshots_created.fetch_add(1, Ordering::Relaxed),
            EventKind::SnapshotInstalled => self.snapshots_installed.fetch_add(1, Ordering::Relaxed),
        };

        let event = MetricEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            term,
            detail: detail.into(),
        };
        let mut events = self.events.write().await;
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn append_entries_received(&self) {
        self.append_entries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entries_committed(&self, count: u64) {
        self.entries_committed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn entries_applied(&self, count: u64) {
        self.entries_applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn command_skipped(&self) {
        self.commands_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_secs: self.start_time.elapsed().as_secs(),
            elections_started: self.elections_started.load(Ordering::Relaxed),
            elections_won: self.elections_won.load(Ordering::Relaxed),
            step_downs: self.step_downs.load(Ordering::Relaxed),
            votes_granted: self.votes_granted.load(Ordering::Relaxed),
            append_entries_received: self.append_entries_received.load(Ordering::Relaxed),
            append_entries_rejected: self.append_entries_rejected.load(Ordering::Relaxed),
            entries_committed: self.entries_committed.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            commands_skipped: self.commands_skipped.load(Ordering::Relaxed),
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
            snapshots_installed: self.snapshots_installed.load(Ordering::Relaxed),
            events_buffered: self.events.read().await.len(),
        }
    }

    pub async fn events(&self) -> Vec<MetricEvent> {
        self.events.read().await.iter().cloned().collect()
    }
}
