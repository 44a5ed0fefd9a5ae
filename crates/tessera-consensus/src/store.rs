//! Persistence of replica progress across restarts.
//!
//! Only what safety needs survives a restart: the view, the prepare and
//! locked certificates, and the committed chain tip. A resumed node enters
//! the view after the persisted one so it can never vote twice in a view.

use crate::crypto::Digest;
use crate::error::{ConsensusError, Result};
use crate::types::Qc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Replica progress that outlives a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Last view the replica was in.
    pub view: u64,
    /// Highest Prepare QC seen.
    pub prepare_qc: Option<Qc>,
    /// Current lock.
    pub locked_qc: Option<Qc>,
    /// Digest of the last committed payload.
    pub committed: Digest,
    /// Number of committed payloads.
    pub height: u64,
}

/// Storage backend for [`PersistedState`].
pub trait StateStore: Send + Sync {
    /// Loads the last saved state, if any.
    fn load(&self) -> Result<Option<PersistedState>>;

    /// Saves the state, replacing any previous one.
    fn save(&self, state: &PersistedState) -> Result<()>;
}

/// Keeps state in memory only. A fresh process starts from view 0.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<PersistedState>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<PersistedState>> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

/// Stores state as a JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Creates a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PersistedState>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| ConsensusError::Store(format!("{}: {}", self.path.display(), e)))
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
