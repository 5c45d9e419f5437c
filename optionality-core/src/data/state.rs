//! Ingestion checkpoints and per-date commit records.
//!
//! Layout under `{root}/_state/`:
//! - `checkpoints/{kind}.json`: one [`IngestionCheckpoint`] per data kind
//! - `commits/{table}/{date}.json`: one [`DateCommit`] per fully loaded file
//!
//! All writes go through a temp file and a rename.

use super::schema::Table;
use super::store::StoreError;
use crate::domain::{DataKind, IngestionCheckpoint};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Record that every partition of one daily file is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateCommit {
    pub table: Table,
    pub date: NaiveDate,
    pub partitions: usize,
    pub rows: u64,
    pub skipped_rows: u64,
    /// blake3 of the compressed source file.
    pub source_hash: String,
    pub committed_at: DateTime<Utc>,
}

/// Durable checkpoint and commit bookkeeping.
pub struct CheckpointLog {
    dir: PathBuf,
}

impl CheckpointLog {
    /// Log stored under `{store_root}/_state`.
    pub fn new(store_root: impl AsRef<Path>) -> Self {
        Self {
            dir: store_root.as_ref().join("_state"),
        }
    }

    fn checkpoint_path(&self, kind: DataKind) -> PathBuf {
        self.dir.join("checkpoints").join(format!("{kind}.json"))
    }

    fn commits_dir(&self, table: Table) -> PathBuf {
        self.dir.join("commits").join(table.name())
    }

    fn commit_path(&self, table: Table, date: NaiveDate) -> PathBuf {
        self.commits_dir(table).join(format!("{date}.json"))
    }

    /// Create the state directories.
    pub fn initialize(&self) -> Result<(), StoreError> {
        for dir in [self.dir.join("checkpoints"), self.dir.join("commits")] {
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::Io(format!("failed to create dir: {e}")))?;
        }
        Ok(())
    }

    /// Current checkpoint, or an empty one if the kind was never loaded.
    pub fn load_checkpoint(&self, kind: DataKind) -> Result<IngestionCheckpoint, StoreError> {
        let checkpoint: Option<IngestionCheckpoint> = read_json(&self.checkpoint_path(kind))?;
        match checkpoint {
            Some(cp) if cp.kind != kind => Err(StoreError::CorruptState {
                path: self.checkpoint_path(kind).display().to_string(),
                reason: format!("holds a {} checkpoint", cp.kind),
            }),
            Some(cp) => Ok(cp),
            None => Ok(IngestionCheckpoint::empty(kind)),
        }
    }

    pub fn save_checkpoint(&self, checkpoint: &IngestionCheckpoint) -> Result<(), StoreError> {
        write_json(&self.checkpoint_path(checkpoint.kind), checkpoint)
    }

    pub fn record_commit(&self, commit: &DateCommit) -> Result<(), StoreError> {
        write_json(&self.commit_path(commit.table, commit.date), commit)
    }

    pub fn commit_for(
        &self,
        table: Table,
        date: NaiveDate,
    ) -> Result<Option<DateCommit>, StoreError> {
        read_json(&self.commit_path(table, date))
    }

    /// Forget a commit record (the date's data is being discarded).
    pub fn remove_commit(&self, table: Table, date: NaiveDate) -> Result<(), StoreError> {
        let path = self.commit_path(table, date);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("remove {}: {e}", path.display()))),
        }
    }

    /// Every commit record of a table, oldest date first.
    pub fn commits(&self, table: Table) -> Result<Vec<DateCommit>, StoreError> {
        let dir = self.commits_dir(table);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut commits = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::Io(format!("read dir: {e}")))? {
            let entry = entry.map_err(|e| StoreError::Io(format!("dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(commit) = read_json::<DateCommit>(&path)? {
                commits.push(commit);
            }
        }
        commits.sort_by_key(|c| c.date);
        Ok(commits)
    }

    /// Drop every checkpoint and commit record.
    pub fn reset(&self) -> Result<(), StoreError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .map_err(|e| StoreError::Io(format!("remove dir: {e}")))?;
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(format!("read {}: {e}", path.display()))),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::CorruptState {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StoreError::Io(format!("failed to create dir: {e}")))?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| StoreError::Io(format!("serialization: {e}")))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json).map_err(|e| StoreError::Io(format!("write: {e}")))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::Io(format!("atomic rename failed: {e}"))
    })
}
