//! Incremental state tracking: which dates still need loading, and when the
//! checkpoint may move.
//!
//! The checkpoint is a value. [`next_dates_to_load`] reads it, [`advance`]
//! derives the next one from a finished batch, and only
//! [`IncrementalTracker::commit_batch`] persists it, once, after every
//! worker has joined.
//!
//! A weekday whose file was not yet published when a later date committed
//! sits behind the checkpoint without a commit record. [`missing_dates`]
//! finds those so `update` can retry them.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use optionality_core::data::{CheckpointLog, StoreError, Table, VendorApi, VendorError};
use optionality_core::domain::{DataKind, IngestionCheckpoint};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::pipeline::{BatchReport, DateOutcome};

/// Weekdays checked backwards when looking for the newest published file.
pub const AVAILABILITY_LOOKBACK_DAYS: i64 = 10;

/// Weekday sessions after the checkpoint, from `history_start` through
/// `available_through` inclusive. Empty when caught up.
pub fn next_dates_to_load(
    checkpoint: &IngestionCheckpoint,
    history_start: NaiveDate,
    available_through: NaiveDate,
) -> Vec<NaiveDate> {
    let first = match checkpoint.last_loaded_date {
        Some(last) => (last + Duration::days(1)).max(history_start),
        None => history_start,
    };

    let mut dates = Vec::new();
    let mut day = first;
    while day <= available_through {
        if is_weekday(day) {
            dates.push(day);
        }
        day += Duration::days(1);
    }
    dates
}

/// Weekdays from `window_start` through the checkpoint that have no commit
/// record. Nothing before the first committed date counts, so history that
/// was never loaded is not mistaken for a gap. Holidays come back too; the
/// vendor reports them as not published.
pub fn missing_dates(
    log: &CheckpointLog,
    checkpoint: &IngestionCheckpoint,
    window_start: NaiveDate,
) -> Result<Vec<NaiveDate>, StoreError> {
    if checkpoint.last_loaded_date.is_none() {
        return Ok(Vec::new());
    }
    let committed: BTreeSet<NaiveDate> = log
        .commits(Table::for_kind(checkpoint.kind))?
        .into_iter()
        .map(|c| c.date)
        .collect();
    let Some(&first) = committed.first() else {
        return Ok(Vec::new());
    };

    let mut gaps = Vec::new();
    let mut day = window_start.max(first);
    while checkpoint.covers(day) {
        if is_weekday(day) && !committed.contains(&day) {
            gaps.push(day);
        }
        day += Duration::days(1);
    }
    if !gaps.is_empty() {
        debug!(kind = %checkpoint.kind, gaps = gaps.len(), "uncommitted weekdays behind checkpoint");
    }
    Ok(gaps)
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Newest date at or before `through` whose file the vendor has published,
/// checking at most [`AVAILABILITY_LOOKBACK_DAYS`] weekdays back.
pub fn latest_available(
    vendor: &dyn VendorApi,
    kind: DataKind,
    through: NaiveDate,
) -> Result<Option<NaiveDate>, VendorError> {
    let mut day = through;
    let mut checked = 0;
    while checked < AVAILABILITY_LOOKBACK_DAYS {
        if is_weekday(day) {
            if vendor.file_available(kind, day)? {
                return Ok(Some(day));
            }
            debug!(%kind, date = %day, "file not published");
            checked += 1;
        }
        day -= Duration::days(1);
    }
    Ok(None)
}

/// The checkpoint after `report`. Any failed or cancelled date leaves it
/// untouched; otherwise it moves to the newest committed date.
pub fn advance(checkpoint: &IngestionCheckpoint, report: &BatchReport) -> IngestionCheckpoint {
    if !report.is_complete() {
        return *checkpoint;
    }
    report
        .dates
        .iter()
        .filter(|d| {
            matches!(
                d.outcome,
                DateOutcome::Committed { .. } | DateOutcome::AlreadyCommitted
            )
        })
        .map(|d| d.date)
        .max()
        .map_or(*checkpoint, |newest| checkpoint.advanced_to(newest))
}

/// Single writer of persisted checkpoints.
pub struct IncrementalTracker<'a> {
    log: &'a CheckpointLog,
}

impl<'a> IncrementalTracker<'a> {
    pub fn new(log: &'a CheckpointLog) -> Self {
        Self { log }
    }

    pub fn checkpoint(&self, kind: DataKind) -> Result<IngestionCheckpoint, StoreError> {
        self.log.load_checkpoint(kind)
    }

    /// Persist the checkpoint that `report` justifies. Called once per batch
    /// after all workers have finished.
    pub fn commit_batch(
        &self,
        before: &IngestionCheckpoint,
        report: &BatchReport,
    ) -> Result<IngestionCheckpoint, StoreError> {
        let after = advance(before, report);
        if after != *before {
            self.log.save_checkpoint(&after)?;
            info!(
                kind = %after.kind,
                from = ?before.last_loaded_date,
                to = ?after.last_loaded_date,
                "checkpoint advanced"
            );
        } else if !report.is_complete() {
            info!(kind = %before.kind, "checkpoint held back by failed dates");
        }
        Ok(after)
    }
}
