//! Checkpoint format and storage.
//!
//! A checkpoint is a [`QueryCheckpoint`]: one entry per registered input
//! and one per join, union or multicast node, each holding the source's own
//! state (ingress bookkeeping or node operator state) and the serialized
//! state of every pipeline attached to it. Operators serialize themselves through
//! [`Operator::serialize_state`](crate::operator::Operator::serialize_state);
//! nothing here reflects over operator internals.
//!
//! Stores persist encoded checkpoints under a query name:
//! - [`MemoryStore`] for tests and embedding
//! - [`FileStore`] for one-file-per-checkpoint durability with atomic writes

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 2;

/// Why a checkpoint could not be written, found or restored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found for '{0}'")]
    NotFound(String),

    #[error("checkpoint data is corrupt: {0}")]
    Corrupt(String),

    #[error("checkpoint version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("checkpoint does not match the query graph: {0}")]
    ShapeMismatch(String),

    #[error("checkpoint I/O error: {0}")]
    Io(String),
}

impl CheckpointError {
    /// True for failures a caller can recover from by starting clean.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CheckpointError::Corrupt(_) | CheckpointError::VersionMismatch { .. } | CheckpointError::ShapeMismatch(_)
        )
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Io(e.to_string())
    }
}

/// Serializes an operator's state into the checkpoint tree.
pub fn state_to_value<T: Serialize>(state: &T) -> Result<Value, CheckpointError> {
    serde_json::to_value(state).map_err(|e| CheckpointError::Corrupt(e.to_string()))
}

/// Reads an operator's state back out of the checkpoint tree.
pub fn state_from_value<T: DeserializeOwned>(value: Value) -> Result<T, CheckpointError> {
    serde_json::from_value(value).map_err(|e| CheckpointError::ShapeMismatch(e.to_string()))
}

// =============================================================================
// Checkpoint structures
// =============================================================================

/// Complete state of a query process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCheckpoint {
    pub version: u32,
    pub inputs: Vec<SourceCheckpoint>,
    pub nodes: Vec<SourceCheckpoint>,
}

/// State of one input or node and the pipelines it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    pub name: String,
    pub state: Value,
    pub pipelines: Vec<PipelineCheckpoint>,
}

/// State of one operator chain, in attachment order. `output` is `None`
/// for chains that feed a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub output: Option<usize>,
    pub state: Value,
}

impl QueryCheckpoint {
    pub fn new(inputs: Vec<SourceCheckpoint>, nodes: Vec<SourceCheckpoint>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            inputs,
            nodes,
        }
    }

    pub fn check_version(&self) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Stores
// =============================================================================

/// Storage backend for encoded checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Stores a checkpoint and returns its sequence number.
    fn save(&self, query: &str, data: &[u8]) -> Result<u64, CheckpointError>;

    /// Loads the most recent checkpoint of a query.
    fn load_latest(&self, query: &str) -> Result<Vec<u8>, CheckpointError>;

    /// Loads a specific checkpoint.
    fn load(&self, query: &str, id: u64) -> Result<Vec<u8>, CheckpointError>;

    /// Sequence numbers of stored checkpoints, oldest first.
    fn list(&self, query: &str) -> Result<Vec<u64>, CheckpointError>;

    /// Deletes all but the most recent `keep` checkpoints. Returns how many
    /// were deleted.
    fn prune(&self, query: &str, keep: usize) -> Result<usize, CheckpointError> {
        let ids = self.list(query)?;
        let to_delete = ids.len().saturating_sub(keep);
        for id in ids.iter().take(to_delete) {
            self.delete(query, *id)?;
        }
        Ok(to_delete)
    }

    /// Deletes one checkpoint. Missing checkpoints are not an error.
    fn delete(&self, query: &str, id: u64) -> Result<(), CheckpointError>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<(u64, Vec<u8>)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> CheckpointError {
    CheckpointError::Io("store lock poisoned".to_string())
}

impl CheckpointStore for MemoryStore {
    fn save(&self, query: &str, data: &[u8]) -> Result<u64, CheckpointError> {
        let mut map = self.data.write().map_err(poisoned)?;
        let entries = map.entry(query.to_string()).or_default();
        let id = entries.last().map_or(1, |(id, _)| id + 1);
        entries.push((id, data.to_vec()));
        Ok(id)
    }

    fn load_latest(&self, query: &str) -> Result<Vec<u8>, CheckpointError> {
        let map = self.data.read().map_err(poisoned)?;
        map.get(query)
            .and_then(|entries| entries.last())
            .map(|(_, data)| data.clone())
            .ok_or_else(|| CheckpointError::NotFound(query.to_string()))
    }

    fn load(&self, query: &str, id: u64) -> Result<Vec<u8>, CheckpointError> {
        let map = self.data.read().map_err(poisoned)?;
        map.get(query)
            .and_then(|entries| entries.iter().find(|(i, _)| *i == id))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| CheckpointError::NotFound(format!("{query}#{id}")))
    }

    fn list(&self, query: &str) -> Result<Vec<u64>, CheckpointError> {
        let map = self.data.read().map_err(poisoned)?;
        Ok(map
            .get(query)
            .map(|entries| entries.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default())
    }

    fn delete(&self, query: &str, id: u64) -> Result<(), CheckpointError> {
        let mut map = self.data.write().map_err(poisoned)?;
        if let Some(entries) = map.get_mut(query) {
            entries.retain(|(i, _)| *i != id);
        }
        Ok(())
    }
}

/// File-based store: `<dir>/<query>/<id>.ckpt`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens or creates a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn query_dir(&self, query: &str) -> PathBuf {
        self.dir.join(query.replace(['/', '\\', ':'], "_"))
    }

    fn path(&self, query: &str, id: u64) -> PathBuf {
        self.query_dir(query).join(format!("{id:010}.ckpt"))
    }
}

impl CheckpointStore for FileStore {
    fn save(&self, query: &str, data: &[u8]) -> Result<u64, CheckpointError> {
        let id = self.list(query)?.last().map_or(1, |id| id + 1);
        let path = self.path(query, id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Atomic write: temp file, then rename
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(id)
    }

    fn load_latest(&self, query: &str) -> Result<Vec<u8>, CheckpointError> {
        match self.list(query)?.last() {
            Some(id) => self.load(query, *id),
            None => Err(CheckpointError::NotFound(query.to_string())),
        }
    }

    fn load(&self, query: &str, id: u64) -> Result<Vec<u8>, CheckpointError> {
        match std::fs::read(self.path(query, id)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointError::NotFound(format!("{query}#{id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, query: &str) -> Result<Vec<u64>, CheckpointError> {
        let dir = self.query_dir(query);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ckpt") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete(&self, query: &str, id: u64) -> Result<(), CheckpointError> {
        match std::fs::remove_file(self.path(query, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_sequence() {
        let store = MemoryStore::new();
        assert_eq!(store.save("q", b"one").unwrap(), 1);
        assert_eq!(store.save("q", b"two").unwrap(), 2);
        assert_eq!(store.load_latest("q").unwrap(), b"two");
        assert_eq!(store.load("q", 1).unwrap(), b"one");
        assert_eq!(store.list("q").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_memory_store_not_found() {
        let store = MemoryStore::new();
        let err = store.load_latest("missing").unwrap_err();
        assert_eq!(err, CheckpointError::NotFound("missing".into()));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_prune_keeps_latest() {
        let store = MemoryStore::new();
        for i in 0..5u8 {
            store.save("q", &[i]).unwrap();
        }
        assert_eq!(store.prune("q", 2).unwrap(), 3);
        assert_eq!(store.list("q").unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("orders", b"alpha").unwrap();
        store.save("orders", b"beta").unwrap();
        assert_eq!(store.load_latest("orders").unwrap(), b"beta");
        assert_eq!(store.prune("orders", 1).unwrap(), 1);
        assert_eq!(store.list("orders").unwrap(), vec![2]);
        assert!(matches!(
            store.load("orders", 1),
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[test]
    fn test_version_check() {
        let mut cp = QueryCheckpoint::new(Vec::new(), Vec::new());
        assert!(cp.check_version().is_ok());
        cp.version = 99;
        let err = cp.check_version().unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_state_value_helpers() {
        let v = state_to_value(&(1u8, "x")).unwrap();
        let back: (u8, String) = state_from_value(v).unwrap();
        assert_eq!(back, (1, "x".to_string()));
        assert!(state_from_value::<u8>(Value::Null).is_err());
    }
}
