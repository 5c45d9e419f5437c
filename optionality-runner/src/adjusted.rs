//! Split-adjusted bars and their technical indicators, computed on demand
//! from raw bars and split history.

use chrono::NaiveDate;
use optionality_core::data::frame::{frame_to_bars, frame_to_splits};
use optionality_core::data::{ColumnarStore, ScanFilter, StoreError, Table};
use optionality_core::domain::RawBar;
use optionality_core::{technicals, SplitHistory, TechnicalRow};
use polars::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to read frame: {0}")]
    Frame(#[from] PolarsError),
}

/// Every split in the store, grouped by ticker.
pub fn load_split_history(store: &dyn ColumnarStore) -> Result<SplitHistory, QueryError> {
    let df = store.scan(Table::Splits, &ScanFilter::all())?.collect()?;
    Ok(SplitHistory::from_events(frame_to_splits(&df)?))
}

/// Raw stock bars of `ticker` within `[start, end]`, sorted by date.
pub fn raw_bars(
    store: &dyn ColumnarStore,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<RawBar>, QueryError> {
    let df = store
        .scan(Table::Stocks, &ScanFilter::symbol(ticker).between(start, end))?
        .sort(["window_start"], SortMultipleOptions::default())
        .collect()?;
    Ok(frame_to_bars(&df)?)
}

/// Split-adjusted stock bars of `ticker` within `[start, end]`. Prices are
/// divided by the cumulative factor; volume and transactions are untouched.
pub fn adjusted_bars(
    store: &dyn ColumnarStore,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<RawBar>, QueryError> {
    let history = load_split_history(store)?;
    adjusted_with(&history, store, ticker, start, end)
}

/// As [`adjusted_bars`], with an already loaded history.
pub fn adjusted_with(
    history: &SplitHistory,
    store: &dyn ColumnarStore,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<RawBar>, QueryError> {
    Ok(raw_bars(store, ticker, start, end)?
        .iter()
        .map(|bar| history.adjust(bar))
        .collect())
}

/// Technical indicators of `ticker` for every session in `[start, end]`.
/// Windows reach back into stored history before `start`.
pub fn technical_series(
    store: &dyn ColumnarStore,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<TechnicalRow>, QueryError> {
    let history = load_split_history(store)?;
    let df = store
        .scan(Table::Stocks, &ScanFilter::symbol(ticker))?
        .sort(["window_start"], SortMultipleOptions::default())
        .collect()?;
    let bars: Vec<RawBar> = frame_to_bars(&df)?
        .iter()
        .filter(|bar| bar.window_start <= end)
        .map(|bar| history.adjust(bar))
        .collect();
    Ok(technicals(&bars)
        .into_iter()
        .filter(|row| row.date >= start)
        .collect())
}
