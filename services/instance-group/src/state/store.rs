//! JSON file state store.
//!
//! The whole group map is written on every save using the write-to-temp +
//! rename pattern, so a concurrent reader sees either the previous file or
//! the new one and never a partial write.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::GroupState;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed store for the group map.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store for the given state file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory holding the state file.
    pub fn ensure_dir(&self) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StateStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Load the group map.
    ///
    /// A missing file is an empty group. A file that exists but cannot be
    /// read or parsed is an error.
    pub fn load(&self) -> Result<GroupState, StateStoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting fresh");
                return Ok(GroupState::new());
            }
            Err(source) => {
                return Err(StateStoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let state: GroupState =
            serde_json::from_str(&content).map_err(|source| StateStoreError::Json {
                path: self.path.clone(),
                source,
            })?;

        info!(
            path = %self.path.display(),
            instance_count = state.len(),
            "Loaded state from disk"
        );

        Ok(state)
    }

    /// Load the group map, starting empty if the file is unusable.
    pub fn load_or_default(&self) -> GroupState {
        match self.load() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "State file unusable, starting with empty state");
                GroupState::new()
            }
        }
    }

    /// Save the group map atomically.
    pub fn save(&self, state: &GroupState) -> Result<(), StateStoreError> {
        let content = serde_json::to_string_pretty(state).map_err(|source| {
            StateStoreError::Json {
                path: self.path.clone(),
                source,
            }
        })?;

        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, content.as_bytes()).map_err(|source| StateStoreError::Io {
            path: tmp_path.clone(),
            source,
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|source| StateStoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(
            path = %self.path.display(),
            instance_count = state.len(),
            "Saved state to disk"
        );

        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
