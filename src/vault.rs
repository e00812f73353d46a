use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::VaultError;

/// A command carried by a replicated log entry. Only committed commands
/// reach the vault, and only through the applier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
    NoOp,
}

/// Serialized form of the vault, used as the snapshot payload on disk and
/// on the InstallSnapshot wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VaultState {
    pub entries: HashMap<String, String>,
}

/// The key-value state machine. Deterministic, in-memory, mutated only by
/// committed log application.
#[derive(Debug, Default)]
pub struct KeyVault {
    entries: HashMap<String, String>,
}

impl KeyVault {
    pub fn new() -> Self {
        KeyVault { entries: HashMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.entries.clone()
    }

    pub fn apply(&mut self, command: &Command) -> Result<(), VaultError> {
        match command {
            Command::Put { key, value } => {
                if key.is_empty() {
                    return Err(VaultError::InvalidCommand("put with empty key".to_string()));
                }
                self.entries.insert(key.clone(), value.clone());
                debug!("applied put for key '{}'", key);
                Ok(())
            }
            Command::Delete { key } => {
                if key.is_empty() {
                    return Err(VaultError::InvalidCommand("delete with empty key".to_string()));
                }
                self.entries.remove(key);
                debug!("applied delete for key '{}'", key);
                Ok(())
            }
            Command::NoOp => Ok(()),
        }
    }

    pub fn export(&self) -> VaultState {
        VaultState { entries: self.entries.clone() }
    }

    pub fn restore(&mut self, state: VaultState) {
        self.entries = state.entries;
    }
}
