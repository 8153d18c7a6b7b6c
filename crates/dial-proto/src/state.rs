use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Control readings that survive a restart.  A dial whose sensor is dead at
/// boot resumes where it was instead of jumping to the default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PersistentState {
    pub dial: Option<f32>,
    pub volume: Option<f32>,
}

/// Clones share one write lock, so saves through any clone never interleave.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_file: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(state_file: PathBuf) -> Self {
        Self {
            state_file,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    /// Missing or corrupt files yield the empty state.
    pub fn load(&self) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(&self.state_file) {
            match serde_json::from_str::<PersistentState>(&content) {
                Ok(persistent) => return persistent,
                Err(e) => warn!("state: ignoring {:?}: {}", self.state_file, e),
            }
        }
        PersistentState::default()
    }

    /// Writes a sibling temp file and renames it over the state file, so a
    /// reader sees either the old or the new contents.
    pub async fn save(&self, state: &PersistentState) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.state_file).await?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .state_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.state_file.with_file_name(name)
    }
}
