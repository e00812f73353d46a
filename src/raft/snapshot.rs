use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

use crate::error::VaultError;
use crate::vault::VaultState;

/// Point-in-time serialization of the state machine plus the log prefix it
/// supersedes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub term_at_creation: u64,
    pub created_at: DateTime<Utc>,
    pub state: VaultState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    pub present: bool,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub file_size_bytes: u64,
    pub key_count: usize,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Owns the snapshot file and its rotated backups. Writes are atomic
/// (temp, fsync, rename) and the previous versions are kept as
/// `snapshot.snap.1` .. `.N` for corruption fallback.
pub struct SnapshotManager {
    dir: PathBuf,
    retain_backups: usize,
    compress: bool,
    current: RwLock<Option<Snapshot>>,
}

impl SnapshotManager {
    pub fn new(data_dir: &Path, retain_backups: usize, compress: bool) -> Self {
        SnapshotManager {
            dir: data_dir.to_path_buf(),
            retain_backups,
            compress,
            current: RwLock::new(None),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join("snapshot.snap")
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("snapshot.snap.{}", n))
    }

    /// Latest snapshot held in memory, if any.
    pub fn current(&self) -> Option<Snapshot> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Durably replace the snapshot file, rotating the previous version
    /// into the backup chain.
    pub fn persist(&self, snapshot: &Snapshot) -> Result<(), VaultError> {
        fs::create_dir_all(&self.dir)?;

        let json = serde_json::to_vec(snapshot)?;
        let bytes = if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?
        } else {
            json
        };

        let tmp = self.dir.join("snapshot.snap.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        self.rotate_backups()?;
        fs::rename(&tmp, self.path())?;

        info!(
            "persisted snapshot at index {} ({} keys, {} bytes)",
            snapshot.last_included_index,
            snapshot.state.entries.len(),
            bytes.len()
        );
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), VaultError> {
        if self.retain_backups == 0 || !self.path().exists() {
            return Ok(());
        }
        let oldest = self.backup_path(self.retain_backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.retain_backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        fs::rename(self.path(), self.backup_path(1))?;
        Ok(())
    }

    /// Load the most recent readable snapshot, falling back through the
    /// backup chain on corruption. Returns None when nothing usable exists;
    /// the node then starts empty and catches up via replication.
    pub fn load(&self) -> Result<Option<Snapshot>, VaultError> {
        let mut candidates = vec![self.path()];
        for n in 1..=self.retain_backups {
            candidates.push(self.backup_path(n));
        }

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::read_snapshot(&path) {
                Ok(snapshot) => {
                    info!(
                        "loaded snapshot at index {} from {}",
                        snapshot.last_included_index,
                        path.display()
                    );
                    *self.current.write().unwrap_or_else(|e| e.into_inner()) =
                        Some(snapshot.clone());
                    return Ok(Some(snapshot));
                }
                Err(e) => {
                    warn!("snapshot {} unreadable, trying backup: {}", path.display(), e);
                }
            }
        }
        Ok(None)
    }

    fn read_snapshot(path: &Path) -> Result<Snapshot, VaultError> {
        let bytes = fs::read(path)?;
        let json = if bytes.starts_with(&GZIP_MAGIC) {
            let mut decoder = GzDecoder::new(&bytes[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        } else {
            bytes
        };
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn status(&self) -> SnapshotStatus {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        let file_size_bytes = fs::metadata(self.path()).map(|m| m.len()).unwrap_or(0);
        match current.as_ref() {
            Some(snapshot) => SnapshotStatus {
                present: true,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                created_at: Some(snapshot.created_at),
                file_size_bytes,
                key_count: snapshot.state.entries.len(),
            },
            None => SnapshotStatus {
                present: false,
                last_included_index: 0,
                last_included_term: 0,
                created_at: None,
                file_size_bytes,
                key_count: 0,
            },
        }
    }
}
