//! Partitioned Parquet store.
//!
//! Layout:
//! - `{root}/stocks/symbol={TICKER}/{date}-{part}.parquet`
//! - `{root}/options/symbol={UNDERLYING}/{date}-{part}.parquet`
//! - `{root}/splits/data.parquet`
//! - `{root}/tickers/data.parquet`
//!
//! Every file is written to a `.tmp` sibling and renamed into place, so a
//! reader never observes a half-written partition. Files are named by the
//! trading date they hold, which makes discarding an interrupted date a
//! matter of deleting its files.

use super::schema::{SchemaError, Table};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const PARTITION_PREFIX: &str = "symbol=";
const SINGLE_FILE: &str = "data.parquet";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("invalid partition key '{0}'")]
    InvalidPartitionKey(String),

    #[error("table {0} is not partitioned")]
    NotPartitioned(Table),

    #[error("table {0} is partitioned and cannot be replaced wholesale")]
    Partitioned(Table),

    #[error("state file {path} is corrupt: {reason}")]
    CorruptState { path: String, reason: String },
}

/// Row selection pushed down to the scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Ticker (stocks, splits, tickers) or underlying (options).
    pub symbol: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    fn admits_date(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// On-disk footprint of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub partitions: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Columnar storage used by ingestion, sync, and verification.
pub trait ColumnarStore: Send + Sync {
    /// Create the table directories.
    fn initialize(&self) -> Result<(), StoreError>;

    /// Atomically write one partition slice of a trading date. Writing the
    /// same `(table, key, date, part)` again replaces the previous file.
    /// Returns the rows written.
    fn commit_partition(
        &self,
        table: Table,
        key: &str,
        date: NaiveDate,
        part: usize,
        frame: DataFrame,
    ) -> Result<usize, StoreError>;

    /// Remove every file of `date`, committed or left over from an
    /// interrupted write. Returns the number of files removed.
    fn discard_date(&self, table: Table, date: NaiveDate) -> Result<usize, StoreError>;

    /// Atomically replace the whole content of a single-file table.
    fn replace_table(&self, table: Table, frame: DataFrame) -> Result<usize, StoreError>;

    /// Lazy scan of a table with the filter pushed down.
    fn scan(&self, table: Table, filter: &ScanFilter) -> Result<LazyFrame, StoreError>;

    /// Drop a table and all its data.
    fn delete_table(&self, table: Table) -> Result<(), StoreError>;

    fn table_stats(&self, table: Table) -> Result<TableStats, StoreError>;
}

/// The Parquet-backed store.
pub struct ParquetStore {
    root: PathBuf,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: Table) -> PathBuf {
        self.root.join(table.name())
    }

    /// `{root}/{table}/symbol={KEY}/`
    fn partition_dir(&self, table: Table, key: &str) -> PathBuf {
        self.table_dir(table).join(format!("{PARTITION_PREFIX}{key}"))
    }

    fn single_file(&self, table: Table) -> PathBuf {
        self.table_dir(table).join(SINGLE_FILE)
    }

    fn partition_dirs(&self, table: Table) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.table_dir(table);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::Io(format!("read dir: {e}")))? {
            let entry = entry.map_err(|e| StoreError::Io(format!("dir entry: {e}")))?;
            let path = entry.path();
            let is_partition = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(PARTITION_PREFIX));
            if is_partition && path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Parquet files of one partition whose trading date passes the filter.
    fn partition_files(dir: &Path, filter: &ScanFilter) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| StoreError::Io(format!("read dir: {e}")))? {
            let entry = entry.map_err(|e| StoreError::Io(format!("dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            match file_date(&path) {
                Some(date) if filter.admits_date(date) => files.push(path),
                Some(_) => {}
                None => warn!(path = %path.display(), "ignoring unrecognised file in store"),
            }
        }
        files.sort();
        Ok(files)
    }
}

impl ColumnarStore for ParquetStore {
    fn initialize(&self) -> Result<(), StoreError> {
        for table in Table::ALL {
            fs::create_dir_all(self.table_dir(table))
                .map_err(|e| StoreError::Io(format!("failed to create dir: {e}")))?;
        }
        Ok(())
    }

    fn commit_partition(
        &self,
        table: Table,
        key: &str,
        date: NaiveDate,
        part: usize,
        mut frame: DataFrame,
    ) -> Result<usize, StoreError> {
        if table.partition_column().is_none() {
            return Err(StoreError::NotPartitioned(table));
        }
        validate_key(key)?;
        table.validate(&frame)?;

        let dir = self.partition_dir(table, key);
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Io(format!("failed to create dir: {e}")))?;
        let path = dir.join(format!("{date}-{part:05}.parquet"));
        write_atomic(&mut frame, &path)?;
        debug!(%table, key, %date, part, rows = frame.height(), "committed partition");
        Ok(frame.height())
    }

    fn discard_date(&self, table: Table, date: NaiveDate) -> Result<usize, StoreError> {
        let prefix = format!("{date}-");
        let mut removed = 0;
        for dir in self.partition_dirs(table)? {
            for entry in fs::read_dir(&dir).map_err(|e| StoreError::Io(format!("read dir: {e}")))? {
                let entry = entry.map_err(|e| StoreError::Io(format!("dir entry: {e}")))?;
                let matches = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(&prefix));
                if matches {
                    fs::remove_file(entry.path())
                        .map_err(|e| StoreError::Io(format!("remove file: {e}")))?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(%table, %date, removed, "discarded date files");
        }
        Ok(removed)
    }

    fn replace_table(&self, table: Table, mut frame: DataFrame) -> Result<usize, StoreError> {
        if table.partition_column().is_some() {
            return Err(StoreError::Partitioned(table));
        }
        table.validate(&frame)?;
        fs::create_dir_all(self.table_dir(table))
            .map_err(|e| StoreError::Io(format!("failed to create dir: {e}")))?;
        write_atomic(&mut frame, &self.single_file(table))?;
        Ok(frame.height())
    }

    fn scan(&self, table: Table, filter: &ScanFilter) -> Result<LazyFrame, StoreError> {
        let files = match table.partition_column() {
            Some(_) => {
                let dirs = match &filter.symbol {
                    Some(symbol) => {
                        validate_key(symbol)?;
                        let dir = self.partition_dir(table, symbol);
                        if dir.is_dir() {
                            vec![dir]
                        } else {
                            Vec::new()
                        }
                    }
                    None => self.partition_dirs(table)?,
                };
                let mut files = Vec::new();
                for dir in dirs {
                    files.extend(Self::partition_files(&dir, filter)?);
                }
                files
            }
            None => {
                let path = self.single_file(table);
                if path.is_file() {
                    vec![path]
                } else {
                    Vec::new()
                }
            }
        };

        if files.is_empty() {
            return Ok(DataFrame::empty_with_schema(&table.schema()).lazy());
        }

        let frames = files
            .iter()
            .map(|path| LazyFrame::scan_parquet(path, ScanArgsParquet::default()))
            .collect::<PolarsResult<Vec<_>>>()
            .map_err(|e| StoreError::Parquet(format!("scan: {e}")))?;
        let mut lf = concat(frames, UnionArgs::default())
            .map_err(|e| StoreError::Parquet(format!("concat: {e}")))?;

        if let Some(symbol) = &filter.symbol {
            lf = lf.filter(col(table.symbol_column()).eq(lit(symbol.as_str())));
        }
        if let Some(date_col) = table.date_column() {
            if let Some(start) = filter.start {
                lf = lf.filter(col(date_col).gt_eq(lit(start)));
            }
            if let Some(end) = filter.end {
                lf = lf.filter(col(date_col).lt_eq(lit(end)));
            }
        }
        Ok(lf)
    }

    fn delete_table(&self, table: Table) -> Result<(), StoreError> {
        let dir = self.table_dir(table);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| StoreError::Io(format!("remove dir: {e}")))?;
        }
        Ok(())
    }

    fn table_stats(&self, table: Table) -> Result<TableStats, StoreError> {
        let mut stats = TableStats::default();
        let files = match table.partition_column() {
            Some(_) => {
                let dirs = self.partition_dirs(table)?;
                stats.partitions = dirs.len();
                let mut files = Vec::new();
                for dir in dirs {
                    files.extend(Self::partition_files(&dir, &ScanFilter::all())?);
                }
                files
            }
            None => {
                let path = self.single_file(table);
                if path.is_file() {
                    stats.partitions = 1;
                    vec![path]
                } else {
                    Vec::new()
                }
            }
        };
        stats.files = files.len();
        for file in files {
            let meta =
                fs::metadata(&file).map_err(|e| StoreError::Io(format!("metadata: {e}")))?;
            stats.bytes += meta.len();
        }
        Ok(stats)
    }
}

/// Whether `key` can name a partition directory without escaping the
/// table directory.
pub fn is_valid_partition_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && !key.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
        && key.len() <= 64
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if is_valid_partition_key(key) {
        Ok(())
    } else {
        Err(StoreError::InvalidPartitionKey(key.to_string()))
    }
}

/// Trading date encoded in a partition file name (`2024-03-05-00000.parquet`).
fn file_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    NaiveDate::parse_from_str(name.get(..10)?, "%Y-%m-%d").ok()
}

/// Write to `{path}.tmp`, then rename over `path`.
fn write_atomic(df: &mut DataFrame, path: &Path) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp_path)
        .map_err(|e| StoreError::Parquet(format!("create file: {e}")))?;
    if let Err(e) = ParquetWriter::new(file).finish(df) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::Parquet(format!("write parquet: {e}")));
    }
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::Io(format!("atomic rename failed: {e}"))
    })
}
