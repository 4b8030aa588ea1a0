use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::types::{Cluster, LogEntry, NodeId, Snapshot, Term};

/// Error type for persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt storage: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Node identity that must survive restarts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub cluster: Cluster,
}

/// Storage abstraction for Raft persistent state. currentTerm, votedFor, the
/// cluster, the log and the latest snapshot must be on stable storage before
/// anything that depends on them is acknowledged: implementations flush to
/// durable media before returning from every `save_*` method.
///
/// Absent state reads as `None` (or an empty log) so a fresh node starts at
/// term 0 with no vote.
pub trait Persistence<C> {
    fn read_metadata(&self) -> Result<Option<Metadata>, StorageError>;

    fn read_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Retained entries in index order.
    fn read_log_entries(&self) -> Result<Vec<LogEntry<C>>, StorageError>;

    fn save_metadata(&mut self, metadata: &Metadata) -> Result<(), StorageError>;

    /// Replace the stored log with `entries`.
    fn save_log_entries(&mut self, entries: &[LogEntry<C>]) -> Result<(), StorageError>;

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}

struct Stored<C> {
    metadata: Option<Metadata>,
    snapshot: Option<Snapshot>,
    entries: Vec<LogEntry<C>>,
}

/// In-memory storage for tests and embedding. Clones share the same state, so
/// a node rebuilt from a clone observes everything its predecessor saved.
pub struct MemoryStorage<C> {
    inner: Arc<Mutex<Stored<C>>>,
}

impl<C> MemoryStorage<C> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Stored {
                metadata: None,
                snapshot: None,
                entries: Vec::new(),
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Stored<C>) -> T) -> T {
        let mut stored = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stored)
    }
}

impl<C> Default for MemoryStorage<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Clone for MemoryStorage<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Clone> Persistence<C> for MemoryStorage<C> {
    fn read_metadata(&self) -> Result<Option<Metadata>, StorageError> {
        Ok(self.with(|s| s.metadata.clone()))
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.with(|s| s.snapshot.clone()))
    }

    fn read_log_entries(&self) -> Result<Vec<LogEntry<C>>, StorageError> {
        Ok(self.with(|s| s.entries.clone()))
    }

    fn save_metadata(&mut self, metadata: &Metadata) -> Result<(), StorageError> {
        self.with(|s| s.metadata = Some(metadata.clone()));
        Ok(())
    }

    fn save_log_entries(&mut self, entries: &[LogEntry<C>]) -> Result<(), StorageError> {
        self.with(|s| s.entries = entries.to_vec());
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.with(|s| s.snapshot = Some(snapshot.clone()));
        Ok(())
    }
}
