//! Integration tests for the flat file to store to adjusted read path.

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use optionality_core::data::frame::{
    bars_to_frame, frame_to_bars, frame_to_splits, option_bars_to_frame, splits_to_frame,
};
use optionality_core::data::{
    ColumnarStore, FlatFile, ParquetStore, Records, ScanFilter, Table,
};
use optionality_core::domain::{DataKind, RawBar, SplitEvent};
use optionality_core::SplitHistory;
use polars::prelude::*;
use std::io::Write;

const HEADER: &str = "ticker,volume,open,close,high,low,window_start,transactions\n";

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Nanoseconds at 04:00 New York (08:00 UTC in summer) on `date`.
fn nanos(date: NaiveDate) -> i64 {
    date.and_hms_opt(8, 0, 0).unwrap().and_utc().timestamp() * 1_000_000_000
}

fn gz(text: &str) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(text.as_bytes()).unwrap();
    enc.finish().unwrap()
}

fn load_file(store: &ParquetStore, file: &FlatFile) {
    for (part, batch) in file.batches(2).unwrap().enumerate() {
        let batch = batch.unwrap();
        match &batch.records {
            Records::Stocks(bars) => {
                let mut by_ticker: std::collections::BTreeMap<&str, Vec<&RawBar>> =
                    Default::default();
                for bar in bars {
                    by_ticker.entry(bar.symbol.as_str()).or_default().push(bar);
                }
                for (ticker, rows) in by_ticker {
                    let df = bars_to_frame(&rows).unwrap();
                    store
                        .commit_partition(Table::Stocks, ticker, file.date, part, df)
                        .unwrap();
                }
            }
            Records::Options(bars) => {
                let mut by_underlying: std::collections::BTreeMap<&str, Vec<_>> =
                    Default::default();
                for bar in bars {
                    by_underlying
                        .entry(bar.identity.underlying_symbol.as_str())
                        .or_default()
                        .push(bar);
                }
                for (underlying, rows) in by_underlying {
                    let df = option_bars_to_frame(&rows).unwrap();
                    store
                        .commit_partition(Table::Options, underlying, file.date, part, df)
                        .unwrap();
                }
            }
        }
    }
}

#[test]
fn aapl_split_week_reads_back_adjusted() {
    let dir = tempfile::tempdir().unwrap();
    let store = ParquetStore::new(dir.path());
    store.initialize().unwrap();

    for (date, close) in [(d(2020, 8, 28), 500.0), (d(2020, 8, 31), 500.0), (d(2020, 9, 1), 125.0)] {
        let text = format!(
            "{HEADER}AAPL,1000,{close},{close},{close},{close},{},10\nMSFT,500,200,200,200,200,{},5\n",
            nanos(date),
            nanos(date)
        );
        load_file(&store, &FlatFile::new(DataKind::Stocks, date, gz(&text)));
    }

    let splits = vec![SplitEvent::new("E1", "AAPL", d(2020, 8, 31), 1, 4).unwrap()];
    store
        .replace_table(Table::Splits, splits_to_frame(&splits).unwrap())
        .unwrap();

    let split_df = store.scan(Table::Splits, &ScanFilter::all()).unwrap().collect().unwrap();
    let history = SplitHistory::from_events(frame_to_splits(&split_df).unwrap());

    let df = store
        .scan(Table::Stocks, &ScanFilter::symbol("AAPL"))
        .unwrap()
        .sort(["window_start"], SortMultipleOptions::default())
        .collect()
        .unwrap();
    let raw = frame_to_bars(&df).unwrap();
    let closes: Vec<f64> = raw.iter().map(|b| b.close).collect();
    assert_eq!(closes, vec![500.0, 500.0, 125.0]);

    let adjusted: Vec<f64> = raw.iter().map(|b| history.adjust(b).close).collect();
    assert_eq!(adjusted, vec![125.0, 125.0, 125.0]);
    assert!(raw.iter().all(|b| history.adjust(b).volume == 1000));

    let msft = store.scan(Table::Stocks, &ScanFilter::symbol("MSFT")).unwrap().collect().unwrap();
    assert_eq!(msft.height(), 3);
}

#[test]
fn options_partition_by_underlying() {
    let dir = tempfile::tempdir().unwrap();
    let store = ParquetStore::new(dir.path());
    store.initialize().unwrap();

    let date = d(2024, 3, 5);
    let ts = nanos(date);
    let text = format!(
        "{HEADER}O:ACB1260116C00001000,10,0.5,0.5,0.5,0.5,{ts},1\n\
         O:ACB260116P00002000,20,0.7,0.7,0.7,0.7,{ts},2\n\
         O:SPY240315P00450500,30,1.1,1.2,1.3,1.0,{ts},3\n"
    );
    load_file(&store, &FlatFile::new(DataKind::Options, date, gz(&text)));

    let acb = store.scan(Table::Options, &ScanFilter::symbol("ACB")).unwrap().collect().unwrap();
    assert_eq!(acb.height(), 2);
    let tickers: Vec<&str> = acb.column("ticker").unwrap().str().unwrap().into_no_null_iter().collect();
    assert!(tickers.contains(&"O:ACB1260116C00001000"));

    let spy = store.scan(Table::Options, &ScanFilter::symbol("SPY")).unwrap().collect().unwrap();
    assert_eq!(spy.height(), 1);
    assert_eq!(spy.column("strike_price").unwrap().f64().unwrap().get(0), Some(450.5));

    let stats = store.table_stats(Table::Options).unwrap();
    assert_eq!(stats.partitions, 2);
}
