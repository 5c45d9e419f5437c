//! Shared fixtures: an in-memory vendor that counts concurrent downloads,
//! and builders for gzip CSV flat files.

#![allow(dead_code)]

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use optionality_core::data::{VendorApi, VendorError};
use optionality_core::domain::{DataKind, SplitEvent, TickerMetadata};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const HEADER: &str = "ticker,volume,open,close,high,low,window_start,transactions\n";

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Session start on `date`, 08:00 UTC, in nanoseconds.
pub fn nanos(date: NaiveDate) -> i64 {
    date.and_hms_opt(8, 0, 0).unwrap().and_utc().timestamp() * 1_000_000_000
}

/// One CSV line with flat OHLC at `close`.
pub fn row(ticker: &str, date: NaiveDate, close: f64) -> String {
    format!(
        "{ticker},1000,{close},{close},{close},{close},{},10\n",
        nanos(date)
    )
}

pub fn gz(text: &str) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(text.as_bytes()).unwrap();
    enc.finish().unwrap()
}

/// Gzip CSV with the vendor header and `lines`.
pub fn flat_file(lines: &[String]) -> Vec<u8> {
    let mut text = HEADER.to_string();
    for line in lines {
        text.push_str(line);
    }
    gz(&text)
}

/// In-memory vendor. Counts downloads and the peak number in flight.
#[derive(Default)]
pub struct MemoryVendor {
    files: HashMap<(DataKind, NaiveDate), Vec<u8>>,
    splits: Vec<SplitEvent>,
    tickers: Vec<TickerMetadata>,
    reference: HashMap<(String, NaiveDate), f64>,
    broken_reference: HashSet<(String, NaiveDate)>,
    failing: HashSet<(DataKind, NaiveDate)>,
    download_delay: Duration,
    unauthorized: bool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    downloads: AtomicUsize,
    reference_calls: AtomicUsize,
}

impl MemoryVendor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, kind: DataKind, date: NaiveDate, bytes: Vec<u8>) -> Self {
        self.files.insert((kind, date), bytes);
        self
    }

    pub fn with_split(mut self, split: SplitEvent) -> Self {
        self.splits.push(split);
        self
    }

    pub fn with_ticker(mut self, ticker: TickerMetadata) -> Self {
        self.tickers.push(ticker);
        self
    }

    pub fn with_reference(mut self, ticker: &str, date: NaiveDate, close: f64) -> Self {
        self.reference.insert((ticker.to_string(), date), close);
        self
    }

    pub fn with_broken_reference(mut self, ticker: &str, date: NaiveDate) -> Self {
        self.broken_reference.insert((ticker.to_string(), date));
        self
    }

    /// Downloads of this file fail with a permanent error.
    pub fn failing(mut self, kind: DataKind, date: NaiveDate) -> Self {
        self.failing.insert((kind, date));
        self
    }

    /// Every reference call is rejected as unauthenticated.
    pub fn unauthorized(mut self) -> Self {
        self.unauthorized = true;
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn reference_calls(&self) -> usize {
        self.reference_calls.load(Ordering::SeqCst)
    }
}

impl VendorApi for MemoryVendor {
    fn name(&self) -> &str {
        "memory"
    }

    fn file_available(&self, kind: DataKind, date: NaiveDate) -> Result<bool, VendorError> {
        Ok(self.files.contains_key(&(kind, date)) || self.failing.contains(&(kind, date)))
    }

    fn download_file(&self, kind: DataKind, date: NaiveDate) -> Result<Vec<u8>, VendorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.downloads.fetch_add(1, Ordering::SeqCst);

        if !self.download_delay.is_zero() {
            std::thread::sleep(self.download_delay);
        }
        let result = if self.failing.contains(&(kind, date)) {
            Err(VendorError::Other(format!("{kind} {date} unavailable")))
        } else {
            self.files
                .get(&(kind, date))
                .cloned()
                .ok_or_else(|| VendorError::NotFound(format!("{kind} {date}")))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn list_splits(&self, since: NaiveDate) -> Result<Vec<SplitEvent>, VendorError> {
        if self.unauthorized {
            return Err(VendorError::AuthenticationRequired("invalid key".into()));
        }
        Ok(self
            .splits
            .iter()
            .filter(|s| s.execution_date >= since)
            .cloned()
            .collect())
    }

    fn list_tickers(&self) -> Result<Vec<TickerMetadata>, VendorError> {
        Ok(self.tickers.clone())
    }

    fn adjusted_close(&self, ticker: &str, date: NaiveDate) -> Result<Option<f64>, VendorError> {
        self.reference_calls.fetch_add(1, Ordering::SeqCst);
        let key = (ticker.to_string(), date);
        if self.broken_reference.contains(&key) {
            return Err(VendorError::Server {
                status: 500,
                context: "reference lookup".into(),
            });
        }
        Ok(self.reference.get(&key).copied())
    }
}
