use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::VaultError;

/// The state that must survive a crash: the last term this node has seen
/// and who it voted for in that term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

/// Synchronous, crash-safe storage for `HardState`. Every save goes
/// through write-temp, fsync, rename; callers must not emit a vote or a
/// term-changing RPC response until `save` has returned Ok.
pub struct HardStateStore {
    path: PathBuf,
}

impl HardStateStore {
    pub fn new(data_dir: &Path) -> Self {
        HardStateStore { path: data_dir.join("hard_state.json") }
    }

    pub fn load(&self) -> Result<HardState, VaultError> {
        if !self.path.exists() {
            return Ok(HardState::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        let state: HardState = serde_json::from_str(&contents)?;
        debug!(
            "loaded hard state: term {} voted_for {:?}",
            state.current_term, state.voted_for
        );
        Ok(state)
    }

    pub fn save(&self, state: &HardState) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string(state)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
