use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::vault::Command;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub applied: bool,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command: Command) -> Self {
        LogEntry { index, term, command, created_at: Utc::now(), applied: false }
    }
}

/// The replicated log. Entries are dense and 1-based; everything at or
/// below `snapshot_index` has been compacted into a snapshot.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        RaftLog { entries: VecDeque::new(), snapshot_index: 0, snapshot_term: 0 }
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.back().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_index || index > self.last_index() {
            return None;
        }
        Some((index - self.snapshot_index - 1) as usize)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).map(|i| &self.entries[i])
    }

    /// Term of the entry at `index`. Index 0 and the compaction point are
    /// answerable without holding the entry itself.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Leader-side append of a fresh command at the next index.
    pub fn append_command(&mut self, term: u64, command: Command) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push_back(LogEntry::new(index, term, command));
        index
    }

    /// Entries from `from` (inclusive) to the end, capped at `max`.
    pub fn slice_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let Some(start) = self.offset(from) else {
            return Vec::new();
        };
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    /// Drop every entry at `from` and above.
    pub fn truncate_from(&mut self, from: u64) {
        while self.last_index() >= from && !self.entries.is_empty() {
            self.entries.pop_back();
        }
    }

    /// Follower-side resolution of incoming entries: keep matching
    /// `(index, term)` prefixes, truncate at the first mismatch, append the
    /// novel suffix. Stale retries therefore leave the log unchanged.
    pub fn resolve(&mut self, incoming: Vec<LogEntry>) {
        for entry in incoming {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    debug!("truncating log from index {} on term conflict", entry.index);
                    self.truncate_from(entry.index);
                    self.entries.push_back(entry);
                }
                None => {
                    if entry.index != self.last_index() + 1 {
                        warn!(
                            "dropping non-contiguous entry at index {} (last index {})",
                            entry.index,
                            self.last_index()
                        );
                        return;
                    }
                    self.entries.push_back(entry);
                }
            }
        }
    }

    /// First index carrying the same term as the entry at `index`; the
    /// earliest point a leader may retry from after a conflict.
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return self.last_index() + 1;
        };
        let mut first = index;
        while first > self.snapshot_index + 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Discard entries covered by a snapshot, keeping any strictly newer
    /// suffix.
    pub fn compact(&mut self, last_included_index: u64, last_included_term: u64) {
        while let Some(front) = self.entries.front() {
            if front.index > last_included_index {
                break;
            }
            self.entries.pop_front();
        }
        self.snapshot_index = last_included_index;
        self.snapshot_term = last_included_term;
    }

    /// Throw the whole log away and restart it at a snapshot point. Used
    /// when an installed snapshot disagrees with the local tail.
    pub fn reset_to_snapshot(&mut self, last_included_index: u64, last_included_term: u64) {
        self.entries.clear();
        self.snapshot_index = last_included_index;
        self.snapshot_term = last_included_term;
    }

    pub fn mark_applied(&mut self, index: u64) {
        if let Some(i) = self.offset(index) {
            self.entries[i].applied = true;
        }
    }

    /// Clear applied flags above a freshly installed snapshot so the
    /// retained suffix is replayed against the replaced state machine.
    pub fn reset_applied_above(&mut self, index: u64) {
        for entry in self.entries.iter_mut() {
            if entry.index > index {
                entry.applied = false;
            }
        }
    }

    /// Committed entries in `(after, up_to]` that have not been applied yet,
    /// in index order.
    pub fn unapplied_range(&self, after: u64, up_to: u64) -> Vec<LogEntry> {
        let mut out = Vec::new();
        for index in (after + 1)..=up_to {
            if let Some(entry) = self.entry(index) {
                if !entry.applied {
                    out.push(entry.clone());
                }
            }
        }
        out
    }
}
