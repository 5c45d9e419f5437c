//! Wholesale refresh of the reference tables: splits and tickers.

use chrono::NaiveDate;
use optionality_core::data::frame::{splits_to_frame, tickers_to_frame};
use optionality_core::data::{
    CheckpointLog, ColumnarStore, StoreError, Table, VendorApi, VendorError,
};
use optionality_core::domain::{is_valid_symbol, SplitEvent, TickerMetadata};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("vendor request failed: {0}")]
    Vendor(#[from] VendorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to build frame: {0}")]
    Frame(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SplitSyncReport {
    pub fetched: usize,
    pub duplicates: usize,
    pub stored: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickerRefreshReport {
    pub fetched: usize,
    pub skipped: usize,
    pub stored: usize,
}

/// Oldest execution date the splits table must reach back to: the earlier of
/// `history_start` and the first committed stocks date. The splits table is
/// replaced wholesale, so syncing from anything later would drop splits
/// that stored bars still need.
pub fn split_history_start(
    log: &CheckpointLog,
    history_start: NaiveDate,
) -> Result<NaiveDate, StoreError> {
    let first_loaded = log.commits(Table::Stocks)?.first().map(|c| c.date);
    Ok(first_loaded.map_or(history_start, |first| first.min(history_start)))
}

/// Replace the splits table with every split executing on or after `since`.
pub fn sync_splits(
    vendor: &dyn VendorApi,
    store: &dyn ColumnarStore,
    since: NaiveDate,
) -> Result<SplitSyncReport, SyncError> {
    let fetched = vendor.list_splits(since)?;
    let fetched_count = fetched.len();
    let splits = dedupe_splits(fetched);
    let duplicates = fetched_count - splits.len();
    if duplicates > 0 {
        debug!(duplicates, "dropped duplicate split records");
    }

    let frame = splits_to_frame(&splits).map_err(|e| SyncError::Frame(e.to_string()))?;
    let stored = store.replace_table(Table::Splits, frame)?;
    info!(%since, fetched = fetched_count, stored, "splits synced");

    Ok(SplitSyncReport {
        fetched: fetched_count,
        duplicates,
        stored,
    })
}

/// Keep the first record per vendor id, then the first per
/// `(ticker, execution_date)`. Output is sorted by ticker, date, id.
pub fn dedupe_splits(mut splits: Vec<SplitEvent>) -> Vec<SplitEvent> {
    splits.sort_by(|a, b| {
        (&a.ticker, a.execution_date, &a.id).cmp(&(&b.ticker, b.execution_date, &b.id))
    });

    let mut ids = HashSet::new();
    let mut sessions = HashSet::new();
    splits.retain(|s| {
        if !ids.insert(s.id.clone()) {
            return false;
        }
        let fresh = sessions.insert((s.ticker.clone(), s.execution_date));
        if !fresh {
            warn!(ticker = %s.ticker, date = %s.execution_date, id = %s.id, "second split on the same day ignored");
        }
        fresh
    });
    splits
}

/// Replace the tickers table with the vendor's current listing.
pub fn refresh_tickers(
    vendor: &dyn VendorApi,
    store: &dyn ColumnarStore,
) -> Result<TickerRefreshReport, SyncError> {
    let fetched = vendor.list_tickers()?;
    let fetched_count = fetched.len();
    let (tickers, skipped) = usable_tickers(fetched);
    if skipped > 0 {
        warn!(skipped, "skipped tickers with unusable symbols");
    }

    let frame = tickers_to_frame(&tickers).map_err(|e| SyncError::Frame(e.to_string()))?;
    let stored = store.replace_table(Table::Tickers, frame)?;
    info!(fetched = fetched_count, stored, "tickers refreshed");

    Ok(TickerRefreshReport {
        fetched: fetched_count,
        skipped,
        stored,
    })
}

/// Valid, unique symbols sorted by ticker, and the count dropped.
fn usable_tickers(tickers: Vec<TickerMetadata>) -> (Vec<TickerMetadata>, usize) {
    let total = tickers.len();
    let mut seen = HashSet::new();
    let mut kept: Vec<TickerMetadata> = tickers
        .into_iter()
        .filter(|t| is_valid_symbol(&t.ticker) && seen.insert(t.ticker.clone()))
        .collect();
    kept.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    let skipped = total - kept.len();
    (kept, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(id: &str, ticker: &str, date: NaiveDate) -> SplitEvent {
        SplitEvent::new(id, ticker, date, 1, 2).unwrap()
    }

    #[test]
    fn dedupe_by_id_then_session() {
        let d1 = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let out = dedupe_splits(vec![
            split("b", "NVDA", d1),
            split("a", "NVDA", d1),
            split("a", "NVDA", d1),
            split("c", "AVGO", d2),
        ]);
        let ids: Vec<&str> = out.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn split_history_reaches_back_to_first_loaded_bar() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path());
        let history_start = NaiveDate::from_ymd_opt(2024, 9, 4).unwrap();
        assert_eq!(split_history_start(&log, history_start).unwrap(), history_start);

        let first = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        log.record_commit(&optionality_core::data::DateCommit {
            table: Table::Stocks,
            date: first,
            partitions: 1,
            rows: 1,
            skipped_rows: 0,
            source_hash: String::new(),
            committed_at: chrono::Utc::now(),
        })
        .unwrap();
        assert_eq!(split_history_start(&log, history_start).unwrap(), first);

        let earlier = NaiveDate::from_ymd_opt(2023, 1, 3).unwrap();
        assert_eq!(split_history_start(&log, earlier).unwrap(), earlier);
    }

    #[test]
    fn unusable_and_repeated_symbols_skipped() {
        let (kept, skipped) = usable_tickers(vec![
            TickerMetadata::new("MSFT"),
            TickerMetadata::new("aapl"),
            TickerMetadata::new(""),
            TickerMetadata::new("BRK.B"),
            TickerMetadata::new("MSFT"),
        ]);
        let symbols: Vec<&str> = kept.iter().map(|t| t.ticker.as_str()).collect();
        assert_eq!(symbols, vec!["BRK.B", "MSFT"]);
        assert_eq!(skipped, 3);
    }
}
