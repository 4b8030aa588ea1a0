use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::{Metadata, Persistence, StorageError};
use crate::types::{LogEntry, Snapshot};

/// Disk-backed storage. Persistent state lives in three files inside `dir`:
///   metadata.json:  current term, voted_for and the cluster table
///   log.jsonl:      one JSON object per retained log entry, one per line
///   snapshot.json:  the latest snapshot, handler state included
///
/// Every file is replaced atomically: write a temp file, fsync, rename over the
/// old one, fsync the directory. A crash leaves either the old or the new
/// version, never a torn file.
pub struct FileStorage<C> {
    dir: PathBuf,
    _entries: PhantomData<fn() -> C>,
}

impl<C> FileStorage<C>
where
    C: Serialize + DeserializeOwned,
{
    /// Open (or create) storage rooted at `dir`. Missing files read as a fresh
    /// node: no metadata, no snapshot, empty log.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            _entries: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Atomically replace `path` with `bytes`: temp file → fsync → rename → fsync dir.
    fn replace(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        // Fsync the directory so the rename is visible after a crash.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl<C> Persistence<C> for FileStorage<C>
where
    C: Serialize + DeserializeOwned,
{
    fn read_metadata(&self) -> Result<Option<Metadata>, StorageError> {
        Self::read_json(&self.metadata_path())
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Self::read_json(&self.snapshot_path())
    }

    fn read_log_entries(&self) -> Result<Vec<LogEntry<C>>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn save_metadata(&mut self, metadata: &Metadata) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(metadata)?;
        self.replace(&self.metadata_path(), &bytes)
    }

    fn save_log_entries(&mut self, entries: &[LogEntry<C>]) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut bytes, entry)?;
            bytes.push(b'\n');
        }
        self.replace(&self.log_path(), &bytes)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.replace(&self.snapshot_path(), &bytes)
    }
}
