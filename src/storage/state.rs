//! Instance state persistence
//!
//! Exactly one record exists per host, serialized as a single JSON file.
//! Writes go through a temp file + rename so readers never observe a
//! partial record.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::instance::InstanceState;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StateResult<T> = Result<T, StateError>;

/// Store for the single persisted instance-state record
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current record. A missing file is the destroyed record.
    pub fn load(&self) -> StateResult<InstanceState> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(InstanceState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the record atomically (write temp, fsync, rename).
    pub fn save(&self, state: &InstanceState) -> StateResult<()> {
        let content = serde_json::to_vec_pretty(state)?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path)?;
        debug!("Persisted instance state to {}", self.path.display());
        Ok(())
    }

    /// Overwrite the record with the destroyed default.
    pub fn clear(&self) -> StateResult<()> {
        self.save(&InstanceState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceStatus;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("instance_state.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_destroyed() {
        let (_dir, store) = store();
        let state = store.load().unwrap();
        assert_eq!(state.status, InstanceStatus::Destroyed);
        assert!(state.container_id.is_empty());
        assert!(state.luks_mapper_name.is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (_dir, store) = store();

        let mut state = InstanceState::default();
        state.instance_id = "abc-123".into();
        state.container_id = "deadbeef".into();
        state.status = InstanceStatus::Running;
        state.luks_mapper_name = "qudata-inst-abc12345".into();
        state
            .allocated_ports
            .insert("80".to_string(), "32001".to_string());
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.instance_id, "abc-123");
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.allocated_ports.get("80").unwrap(), "32001");
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let (dir, store) = store();
        store.save(&InstanceState::default()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_clear_resets_to_destroyed() {
        let (_dir, store) = store();

        let mut state = InstanceState::default();
        state.status = InstanceStatus::Running;
        state.container_id = "deadbeef".into();
        store.save(&state).unwrap();

        store.clear().unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Destroyed);
        assert!(loaded.container_id.is_empty());
    }
}
