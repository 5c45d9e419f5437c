//! Ingestion pipeline: download, stream-parse and commit daily flat files.
//!
//! Two independent rayon pools do the work. The download pool fetches files
//! and hands them over a bounded channel to a dispatcher, which feeds the
//! processing pool while holding at most `processing_concurrency` files in
//! flight. Every date ends in exactly one [`DateOutcome`]; a failed date
//! never stops its siblings unless the run's failure budget is exhausted.
//!
//! A date is loaded by first discarding any residue of an earlier attempt,
//! then committing one file per `(partition key, batch)`, then recording a
//! [`DateCommit`]. On any error the date's files are discarded again, so a
//! reader never sees a partially loaded date once the run has finished.

use chrono::{NaiveDate, Utc};
use optionality_core::data::frame::{bars_to_frame, option_bars_to_frame};
use optionality_core::data::{
    backoff_delay, is_valid_partition_key, CheckpointLog, ColumnarStore, DateCommit, FlatFile,
    FlatFileError, MalformedRow, Records, StoreError, Table, VendorApi, VendorError,
};
use optionality_core::domain::DataKind;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::PipelineSettings;

/// Failure of one date's file. Contained to that date.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("download failed: {0}")]
    Download(#[from] VendorError),

    #[error(transparent)]
    Read(#[from] FlatFileError),

    #[error("{malformed} of {seen} rows malformed, over the error-rate threshold")]
    ErrorRateExceeded { malformed: usize, seen: usize },

    #[error("failed to build frame: {0}")]
    Frame(String),

    #[error("commit failed: {0}")]
    Commit(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to build {pool} pool: {reason}")]
    ThreadPool { pool: &'static str, reason: String },
}

/// Retry with exponential backoff, for transient vendor errors only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, VendorError>,
    ) -> Result<T, VendorError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = match &e {
                        VendorError::RateLimited { retry_after_secs } => {
                            Duration::from_secs(*retry_after_secs)
                        }
                        _ => backoff_delay(self.base_delay, attempt),
                    };
                    attempt += 1;
                    warn!(attempt, max = self.max_retries, error = %e, "transient vendor error, retrying");
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// When malformed rows make a whole file unacceptable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowErrorPolicy {
    pub max_rate: f64,
    /// Rows seen before the rate is judged mid-file.
    pub min_rows: usize,
    /// Malformed rows logged individually per file.
    pub log_first: usize,
}

impl RowErrorPolicy {
    /// Judgement while the file is still being read.
    pub fn exceeded(&self, malformed: usize, seen: usize) -> bool {
        seen > 0 && seen >= self.min_rows && rate(malformed, seen) > self.max_rate
    }

    /// Judgement once every row has been read. A file with no good rows is
    /// always rejected, whatever its size.
    pub fn exceeded_at_end(&self, malformed: usize, seen: usize) -> bool {
        (malformed > 0 && malformed == seen) || self.exceeded(malformed, seen)
    }
}

fn rate(part: usize, whole: usize) -> f64 {
    part as f64 / whole as f64
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub download_concurrency: usize,
    pub processing_concurrency: usize,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub row_errors: RowErrorPolicy,
    /// Failed share of a run's dates that cancels the rest.
    pub max_failed_fraction: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(s: &PipelineSettings) -> Self {
        Self {
            download_concurrency: s.download_concurrency.max(1),
            processing_concurrency: s.processing_concurrency.max(1),
            batch_size: s.batch_size.max(1),
            retry: RetryPolicy {
                max_retries: s.download_retries,
                base_delay: Duration::from_millis(s.retry_base_delay_ms),
            },
            row_errors: RowErrorPolicy {
                max_rate: s.max_row_error_rate,
                min_rows: s.min_rows_for_error_rate,
                log_first: s.log_malformed_rows,
            },
            max_failed_fraction: s.max_failed_fraction,
        }
    }
}

/// How one date ended.
#[derive(Debug)]
pub enum DateOutcome {
    Committed {
        rows: u64,
        skipped_rows: u64,
        partitions: usize,
    },
    /// Already carries a commit record; nothing is downloaded or rewritten.
    AlreadyCommitted,
    /// The vendor has not published a file for this date.
    NotAvailable,
    Failed(FileError),
    /// Not attempted because the run's failure budget ran out.
    Cancelled,
}

impl DateOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DateOutcome::Committed { .. } => "committed",
            DateOutcome::AlreadyCommitted => "already committed",
            DateOutcome::NotAvailable => "not available",
            DateOutcome::Failed(_) => "failed",
            DateOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct DateReport {
    pub date: NaiveDate,
    pub outcome: DateOutcome,
}

/// Outcome of every date of one batch, sorted by date.
#[derive(Debug)]
pub struct BatchReport {
    pub kind: DataKind,
    pub dates: Vec<DateReport>,
}

/// Per-outcome tallies of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub committed: usize,
    pub already_committed: usize,
    pub not_available: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub rows: u64,
    pub skipped_rows: u64,
}

impl BatchReport {
    pub fn empty(kind: DataKind) -> Self {
        Self {
            kind,
            dates: Vec::new(),
        }
    }

    /// No date failed or was cancelled.
    pub fn is_complete(&self) -> bool {
        !self
            .dates
            .iter()
            .any(|d| matches!(d.outcome, DateOutcome::Failed(_) | DateOutcome::Cancelled))
    }

    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for d in &self.dates {
            match &d.outcome {
                DateOutcome::Committed {
                    rows, skipped_rows, ..
                } => {
                    counts.committed += 1;
                    counts.rows += rows;
                    counts.skipped_rows += skipped_rows;
                }
                DateOutcome::AlreadyCommitted => counts.already_committed += 1,
                DateOutcome::NotAvailable => counts.not_available += 1,
                DateOutcome::Failed(_) => counts.failed += 1,
                DateOutcome::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// `(date, message)` for every failed date.
    pub fn failures(&self) -> Vec<(NaiveDate, String)> {
        self.dates
            .iter()
            .filter_map(|d| match &d.outcome {
                DateOutcome::Failed(e) => Some((d.date, e.to_string())),
                _ => None,
            })
            .collect()
    }
}

/// Callbacks as dates finish. Called from worker threads.
pub trait IngestProgress: Send + Sync {
    fn on_date_complete(&self, kind: DataKind, report: &DateReport, done: usize, total: usize);

    fn on_batch_complete(&self, report: &BatchReport);
}

/// Progress reported through `tracing`.
pub struct LogProgress;

impl IngestProgress for LogProgress {
    fn on_date_complete(&self, kind: DataKind, report: &DateReport, done: usize, total: usize) {
        match &report.outcome {
            DateOutcome::Committed {
                rows,
                skipped_rows,
                partitions,
            } => info!(
                %kind, date = %report.date, rows, skipped_rows, partitions,
                "[{done}/{total}] committed"
            ),
            DateOutcome::Failed(e) => {
                error!(%kind, date = %report.date, error = %e, "[{done}/{total}] failed")
            }
            other => info!(%kind, date = %report.date, "[{done}/{total}] {}", other.label()),
        }
    }

    fn on_batch_complete(&self, report: &BatchReport) {
        let c = report.counts();
        info!(
            kind = %report.kind,
            committed = c.committed,
            already_committed = c.already_committed,
            not_available = c.not_available,
            failed = c.failed,
            cancelled = c.cancelled,
            rows = c.rows,
            "batch complete"
        );
    }
}

/// Shared failure count of one run. Trips once failures exceed the
/// configured share of the run's dates.
pub struct FailureBudget {
    total: usize,
    max_fraction: f64,
    failures: AtomicUsize,
    cancelled: AtomicBool,
}

impl FailureBudget {
    pub fn new(total: usize, max_fraction: f64) -> Self {
        Self {
            total,
            max_fraction,
            failures: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Count a failure. Returns true if this one exhausted the budget.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let over = self.total > 0 && rate(failures, self.total) > self.max_fraction;
        over && !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Result of the download stage for one date.
enum Fetched {
    File(FlatFile),
    NotAvailable,
    Failed(FileError),
    Cancelled,
}

/// Rows and partitions written for one date.
#[derive(Debug, Default)]
struct LoadStats {
    rows: u64,
    skipped_rows: u64,
    partitions: BTreeSet<String>,
}

pub struct IngestPipeline<'a> {
    vendor: &'a dyn VendorApi,
    store: &'a dyn ColumnarStore,
    log: &'a CheckpointLog,
    config: PipelineConfig,
    download_pool: rayon::ThreadPool,
    process_pool: rayon::ThreadPool,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(
        vendor: &'a dyn VendorApi,
        store: &'a dyn ColumnarStore,
        log: &'a CheckpointLog,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let download_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.download_concurrency.max(1))
            .thread_name(|i| format!("download-{i}"))
            .build()
            .map_err(|e| PipelineError::ThreadPool {
                pool: "download",
                reason: e.to_string(),
            })?;
        let process_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.processing_concurrency.max(1))
            .thread_name(|i| format!("process-{i}"))
            .build()
            .map_err(|e| PipelineError::ThreadPool {
                pool: "process",
                reason: e.to_string(),
            })?;

        Ok(Self {
            vendor,
            store,
            log,
            config,
            download_pool,
            process_pool,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load every date of `dates` for `kind`. Never fails as a whole; each
    /// date's result is in the report.
    pub fn run(
        &self,
        kind: DataKind,
        dates: &[NaiveDate],
        progress: &dyn IngestProgress,
    ) -> BatchReport {
        let table = Table::for_kind(kind);
        let total = dates.len();
        let done = AtomicUsize::new(0);
        let (done_tx, done_rx) = mpsc::channel::<DateReport>();

        let finish = |report: DateReport| {
            let n = done.fetch_add(1, Ordering::SeqCst) + 1;
            progress.on_date_complete(kind, &report, n, total);
            let _ = done_tx.send(report);
        };

        let mut pending = Vec::new();
        for &date in dates {
            match self.log.commit_for(table, date) {
                Ok(Some(_)) => finish(DateReport {
                    date,
                    outcome: DateOutcome::AlreadyCommitted,
                }),
                Ok(None) => pending.push(date),
                Err(e) => finish(DateReport {
                    date,
                    outcome: DateOutcome::Failed(e.into()),
                }),
            }
        }

        if !pending.is_empty() {
            info!(%kind, dates = pending.len(), "loading");
            self.load_pending(kind, table, &pending, &finish);
        }

        drop(done_tx);
        let mut report = BatchReport {
            kind,
            dates: done_rx.into_iter().collect(),
        };
        report.dates.sort_by_key(|d| d.date);
        progress.on_batch_complete(&report);
        report
    }

    fn load_pending(
        &self,
        kind: DataKind,
        table: Table,
        pending: &[NaiveDate],
        finish: &(dyn Fn(DateReport) + Sync),
    ) {
        let budget = FailureBudget::new(pending.len(), self.config.max_failed_fraction);
        let slots = self.config.processing_concurrency;
        let (file_tx, file_rx) = mpsc::sync_channel::<(NaiveDate, Fetched)>(slots);
        let (slot_tx, slot_rx) = mpsc::sync_channel::<()>(slots);
        for _ in 0..slots {
            let _ = slot_tx.send(());
        }

        let report = |date: NaiveDate, outcome: DateOutcome| {
            if matches!(outcome, DateOutcome::Failed(_)) && budget.record_failure() {
                warn!(%kind, "failure budget exhausted, cancelling remaining dates");
            }
            finish(DateReport { date, outcome });
        };

        std::thread::scope(|s| {
            let budget = &budget;
            s.spawn(move || {
                self.download_pool.install(|| {
                    pending.par_iter().for_each_with(file_tx, |tx, &date| {
                        let fetched = self.fetch(kind, date, budget);
                        let _ = tx.send((date, fetched));
                    });
                });
            });

            self.process_pool.in_place_scope(|ps| {
                for (date, fetched) in file_rx {
                    let file = match fetched {
                        Fetched::File(file) => file,
                        Fetched::NotAvailable => {
                            report(date, DateOutcome::NotAvailable);
                            continue;
                        }
                        Fetched::Failed(e) => {
                            report(date, DateOutcome::Failed(e));
                            continue;
                        }
                        Fetched::Cancelled => {
                            report(date, DateOutcome::Cancelled);
                            continue;
                        }
                    };

                    if slot_rx.recv().is_err() {
                        report(date, DateOutcome::Cancelled);
                        continue;
                    }
                    if budget.is_cancelled() {
                        let _ = slot_tx.send(());
                        report(date, DateOutcome::Cancelled);
                        continue;
                    }

                    let slot_tx = slot_tx.clone();
                    let report = &report;
                    ps.spawn(move |_| {
                        let outcome = match self.load_file(table, &file) {
                            Ok(stats) => DateOutcome::Committed {
                                rows: stats.rows,
                                skipped_rows: stats.skipped_rows,
                                partitions: stats.partitions.len(),
                            },
                            Err(e) => DateOutcome::Failed(e),
                        };
                        drop(file);
                        let _ = slot_tx.send(());
                        report(date, outcome);
                    });
                }
            });
        });
    }

    fn fetch(&self, kind: DataKind, date: NaiveDate, budget: &FailureBudget) -> Fetched {
        if budget.is_cancelled() {
            return Fetched::Cancelled;
        }
        match self.config.retry.run(|| self.vendor.file_available(kind, date)) {
            Ok(true) => {}
            Ok(false) => return Fetched::NotAvailable,
            Err(e) => return Fetched::Failed(e.into()),
        }
        match self.config.retry.run(|| self.vendor.download_file(kind, date)) {
            Ok(bytes) => {
                debug!(%kind, %date, bytes = bytes.len(), "downloaded");
                Fetched::File(FlatFile::new(kind, date, bytes))
            }
            Err(VendorError::NotFound(_)) => Fetched::NotAvailable,
            Err(e) => Fetched::Failed(e.into()),
        }
    }

    /// Load one file, leaving no trace of the date on failure.
    fn load_file(&self, table: Table, file: &FlatFile) -> Result<LoadStats, FileError> {
        self.log.remove_commit(table, file.date)?;
        let removed = self.store.discard_date(table, file.date)?;
        if removed > 0 {
            warn!(%table, date = %file.date, removed, "discarded residue of an earlier attempt");
        }

        match self.write_file(table, file) {
            Ok(stats) => Ok(stats),
            Err(e) => {
                if let Err(cleanup) = self.store.discard_date(table, file.date) {
                    error!(%table, date = %file.date, error = %cleanup, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn write_file(&self, table: Table, file: &FlatFile) -> Result<LoadStats, FileError> {
        let policy = self.config.row_errors;
        let mut stats = LoadStats::default();
        let mut seen = 0usize;
        let mut malformed = 0usize;
        let mut logged = 0usize;

        for (part, batch) in file.batches(self.config.batch_size)?.enumerate() {
            let batch = batch?;
            seen += batch.rows_seen();
            let mut rejected = batch.malformed;

            match batch.records {
                Records::Stocks(bars) => {
                    let (groups, bad) = group_by_key(bars.iter(), |b| b.symbol.as_str());
                    rejected.extend(bad);
                    for (key, rows) in groups {
                        let frame =
                            bars_to_frame(&rows).map_err(|e| FileError::Frame(e.to_string()))?;
                        stats.rows +=
                            self.store.commit_partition(table, key, file.date, part, frame)? as u64;
                        stats.partitions.insert(key.to_string());
                    }
                }
                Records::Options(bars) => {
                    let (groups, bad) =
                        group_by_key(bars.iter(), |b| b.identity.underlying_symbol.as_str());
                    rejected.extend(bad);
                    for (key, rows) in groups {
                        let frame = option_bars_to_frame(&rows)
                            .map_err(|e| FileError::Frame(e.to_string()))?;
                        stats.rows +=
                            self.store.commit_partition(table, key, file.date, part, frame)? as u64;
                        stats.partitions.insert(key.to_string());
                    }
                }
            }

            malformed += rejected.len();
            for row in &rejected {
                if logged < policy.log_first {
                    warn!(%table, date = %file.date, line = row.line, reason = %row.reason, "skipping malformed row");
                    logged += 1;
                }
            }
            if policy.exceeded(malformed, seen) {
                return Err(FileError::ErrorRateExceeded { malformed, seen });
            }
        }

        if policy.exceeded_at_end(malformed, seen) {
            return Err(FileError::ErrorRateExceeded { malformed, seen });
        }
        if malformed > logged {
            warn!(%table, date = %file.date, unlogged = malformed - logged, "further malformed rows skipped");
        }
        stats.skipped_rows = malformed as u64;

        self.log.record_commit(&DateCommit {
            table,
            date: file.date,
            partitions: stats.partitions.len(),
            rows: stats.rows,
            skipped_rows: stats.skipped_rows,
            source_hash: file.content_hash(),
            committed_at: Utc::now(),
        })?;
        Ok(stats)
    }
}

/// Group rows by partition key. Rows whose key cannot name a partition
/// come back as malformed; their source line is no longer known, so it is 0.
fn group_by_key<'r, T>(
    rows: impl Iterator<Item = &'r T>,
    key: impl Fn(&'r T) -> &'r str,
) -> (BTreeMap<&'r str, Vec<&'r T>>, Vec<MalformedRow>) {
    let mut groups: BTreeMap<&str, Vec<&T>> = BTreeMap::new();
    let mut bad = Vec::new();
    for row in rows {
        let k = key(row);
        if is_valid_partition_key(k) {
            groups.entry(k).or_default().push(row);
        } else {
            bad.push(MalformedRow {
                line: 0,
                reason: format!("unusable partition key '{k}'"),
            });
        }
    }
    (groups, bad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn retry_recovers_from_transient_errors() {
        let calls = Cell::new(0);
        let result = quick_retry(3).run(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(VendorError::NetworkUnreachable("reset".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: Result<(), _> = quick_retry(2).run(|| {
            calls.set(calls.get() + 1);
            Err(VendorError::Server {
                status: 503,
                context: "busy".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_never_repeats_permanent_errors() {
        let calls = Cell::new(0);
        let result: Result<(), _> = quick_retry(5).run(|| {
            calls.set(calls.get() + 1);
            Err(VendorError::AuthenticationRequired("bad key".into()))
        });
        assert!(matches!(result, Err(VendorError::AuthenticationRequired(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn row_error_rate_needs_minimum_sample_mid_file() {
        let policy = RowErrorPolicy {
            max_rate: 0.01,
            min_rows: 1000,
            log_first: 5,
        };
        assert!(!policy.exceeded(50, 100));
        assert!(policy.exceeded(11, 1000));
        assert!(!policy.exceeded(10, 1000));
    }

    #[test]
    fn row_error_rate_at_end_rejects_all_bad_files() {
        let policy = RowErrorPolicy {
            max_rate: 0.01,
            min_rows: 1000,
            log_first: 5,
        };
        assert!(policy.exceeded_at_end(3, 3));
        assert!(!policy.exceeded_at_end(1, 3));
        assert!(!policy.exceeded_at_end(0, 0));
    }

    #[test]
    fn failure_budget_trips_once_over_fraction() {
        let budget = FailureBudget::new(4, 0.5);
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert!(!budget.is_cancelled());
        assert!(budget.record_failure());
        assert!(budget.is_cancelled());
        // Only the tripping failure reports it.
        assert!(!budget.record_failure());
    }

    #[test]
    fn grouping_rejects_unusable_keys() {
        let keys = ["AAPL", "MSFT", "AAPL", "../x", ""];
        let (groups, bad) = group_by_key(keys.iter(), |k| *k);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["AAPL"].len(), 2);
        assert_eq!(bad.len(), 2);
    }

    #[test]
    fn batch_counts_and_completeness() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let report = BatchReport {
            kind: DataKind::Stocks,
            dates: vec![
                DateReport {
                    date: d,
                    outcome: DateOutcome::Committed {
                        rows: 7,
                        skipped_rows: 1,
                        partitions: 3,
                    },
                },
                DateReport {
                    date: d.succ_opt().unwrap(),
                    outcome: DateOutcome::NotAvailable,
                },
            ],
        };
        assert!(report.is_complete());
        let c = report.counts();
        assert_eq!((c.committed, c.not_available, c.rows, c.skipped_rows), (1, 1, 7, 1));
        assert!(report.failures().is_empty());
    }
}
