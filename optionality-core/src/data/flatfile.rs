//! Streaming reader for one daily flat file.
//!
//! Files are gzip-compressed CSV with the header
//! `ticker,volume,open,close,high,low,window_start,transactions`, where
//! `window_start` is nanoseconds since the Unix epoch. Rows are decoded in
//! batches of bounded size; malformed rows are reported alongside each batch
//! instead of aborting the file.

use crate::domain::{DataKind, OptionBar, RawBar};
use crate::option_symbol::decode_option_ticker;
use chrono::{DateTime, NaiveDate};
use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use thiserror::Error;

pub const EXPECTED_HEADER: [&str; 8] = [
    "ticker",
    "volume",
    "open",
    "close",
    "high",
    "low",
    "window_start",
    "transactions",
];

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Errors that make the whole file unreadable.
#[derive(Debug, Error)]
pub enum FlatFileError {
    #[error("flat file {date} ({kind}) has unexpected header: {found}")]
    UnexpectedHeader {
        kind: DataKind,
        date: NaiveDate,
        found: String,
    },

    #[error("flat file {date} ({kind}) is corrupt near line {line}: {reason}")]
    Corrupt {
        kind: DataKind,
        date: NaiveDate,
        line: u64,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    ticker: String,
    volume: f64,
    open: f64,
    close: f64,
    high: f64,
    low: f64,
    window_start: i64,
    transactions: u64,
}

/// A row that could not be turned into a bar.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRow {
    pub line: u64,
    pub reason: String,
}

/// Decoded rows of one batch, typed by the file's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Records {
    Stocks(Vec<RawBar>),
    Options(Vec<OptionBar>),
}

impl Records {
    fn empty(kind: DataKind) -> Self {
        match kind {
            DataKind::Stocks => Records::Stocks(Vec::new()),
            DataKind::Options => Records::Options(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Records::Stocks(bars) => bars.len(),
            Records::Options(bars) => bars.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    pub records: Records,
    pub malformed: Vec<MalformedRow>,
}

impl RowBatch {
    /// Rows seen in this batch, good and bad.
    pub fn rows_seen(&self) -> usize {
        self.records.len() + self.malformed.len()
    }
}

/// One downloaded daily file, still compressed.
#[derive(Debug, Clone)]
pub struct FlatFile {
    pub kind: DataKind,
    pub date: NaiveDate,
    compressed: Vec<u8>,
}

impl FlatFile {
    pub fn new(kind: DataKind, date: NaiveDate, compressed: Vec<u8>) -> Self {
        Self {
            kind,
            date,
            compressed,
        }
    }

    pub fn compressed_len(&self) -> usize {
        self.compressed.len()
    }

    /// blake3 hash of the compressed bytes, hex encoded.
    pub fn content_hash(&self) -> String {
        blake3::hash(&self.compressed).to_hex().to_string()
    }

    /// Start a fresh pass over the rows. Each call restarts from the top of
    /// the file, so a failed load can simply be retried.
    pub fn batches(&self, batch_size: usize) -> Result<RowBatches<'_>, FlatFileError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(MultiGzDecoder::new(self.compressed.as_slice()));

        let headers = reader
            .headers()
            .map_err(|e| FlatFileError::Corrupt {
                kind: self.kind,
                date: self.date,
                line: 1,
                reason: e.to_string(),
            })?
            .clone();

        let found: Vec<&str> = headers.iter().map(str::trim).collect();
        if found != EXPECTED_HEADER {
            return Err(FlatFileError::UnexpectedHeader {
                kind: self.kind,
                date: self.date,
                found: found.join(","),
            });
        }

        Ok(RowBatches {
            reader,
            headers,
            record: csv::StringRecord::new(),
            kind: self.kind,
            date: self.date,
            batch_size: batch_size.max(1),
            finished: false,
        })
    }
}

/// Iterator of decoded batches. Yields `Err` at most once, for a stream
/// level failure, and then stops.
pub struct RowBatches<'a> {
    reader: csv::Reader<MultiGzDecoder<&'a [u8]>>,
    headers: csv::StringRecord,
    record: csv::StringRecord,
    kind: DataKind,
    date: NaiveDate,
    batch_size: usize,
    finished: bool,
}

impl RowBatches<'_> {
    fn decode_bar(&self) -> Result<RawBar, String> {
        let row: CsvRow = self
            .record
            .deserialize(Some(&self.headers))
            .map_err(|e| e.to_string())?;
        row_to_bar(row)
    }
}

impl Iterator for RowBatches<'_> {
    type Item = Result<RowBatch, FlatFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut records = Records::empty(self.kind);
        let mut malformed = Vec::new();

        while records.len() + malformed.len() < self.batch_size {
            let line = self.reader.position().line();
            match self.reader.read_record(&mut self.record) {
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Ok(true) => {
                    let decoded = self.decode_bar().and_then(|bar| match &mut records {
                        Records::Stocks(all) => {
                            all.push(bar);
                            Ok(())
                        }
                        Records::Options(all) => decode_option_ticker(&bar.symbol)
                            .map(|identity| all.push(OptionBar { bar, identity }))
                            .map_err(|e| e.to_string()),
                    });
                    if let Err(reason) = decoded {
                        malformed.push(MalformedRow {
                            line: self.record.position().map_or(line, |p| p.line()),
                            reason,
                        });
                    }
                }
                Err(e) => {
                    if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                        self.finished = true;
                        return Some(Err(FlatFileError::Corrupt {
                            kind: self.kind,
                            date: self.date,
                            line,
                            reason: e.to_string(),
                        }));
                    }
                    malformed.push(MalformedRow {
                        line,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if records.is_empty() && malformed.is_empty() {
            return None;
        }
        Some(Ok(RowBatch { records, malformed }))
    }
}

fn row_to_bar(row: CsvRow) -> Result<RawBar, String> {
    if row.ticker.trim().is_empty() {
        return Err("empty ticker".into());
    }
    if !row.volume.is_finite() || row.volume < 0.0 {
        return Err(format!("invalid volume {}", row.volume));
    }
    let window_start = date_from_nanos(row.window_start)
        .ok_or_else(|| format!("window_start {} out of range", row.window_start))?;

    let bar = RawBar {
        symbol: row.ticker.trim().to_string(),
        window_start,
        volume: row.volume.round() as u64,
        open: row.open,
        close: row.close,
        high: row.high,
        low: row.low,
        transactions: row.transactions,
    };
    if !bar.has_valid_prices() {
        return Err(format!("invalid prices for {}", bar.symbol));
    }
    Ok(bar)
}

/// UTC calendar date of a nanosecond epoch timestamp.
pub fn date_from_nanos(nanos: i64) -> Option<NaiveDate> {
    let secs = nanos.div_euclid(NANOS_PER_SECOND);
    let sub = nanos.rem_euclid(NANOS_PER_SECOND) as u32;
    DateTime::from_timestamp(secs, sub).map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const HEADER: &str = "ticker,volume,open,close,high,low,window_start,transactions\n";
    // 2024-03-05 05:00:00 UTC
    const TS: i64 = 1_709_614_800_000_000_000;

    fn gz(text: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn stock_file(rows: &[String]) -> FlatFile {
        let body: String = rows.iter().map(|r| format!("{r}\n")).collect();
        FlatFile::new(DataKind::Stocks, d(2024, 3, 5), gz(&format!("{HEADER}{body}")))
    }

    fn stock_row(ticker: &str, close: f64) -> String {
        format!("{ticker},1000,{close},{close},{close},{close},{TS},12")
    }

    #[test]
    fn nanos_convert_to_utc_date() {
        assert_eq!(date_from_nanos(TS), Some(d(2024, 3, 5)));
        assert_eq!(date_from_nanos(0), Some(d(1970, 1, 1)));
    }

    #[test]
    fn reads_rows_in_bounded_batches() {
        let rows: Vec<String> = (0..5).map(|i| stock_row(&format!("T{i}"), 10.0)).collect();
        let file = stock_file(&rows);
        let batches: Vec<RowBatch> = file.batches(2).unwrap().map(|b| b.unwrap()).collect();
        let sizes: Vec<usize> = batches.iter().map(|b| b.records.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn batches_restart_from_the_top() {
        let file = stock_file(&[stock_row("AAPL", 1.0), stock_row("MSFT", 2.0)]);
        let first: usize = file.batches(10).unwrap().map(|b| b.unwrap().rows_seen()).sum();
        let second: usize = file.batches(10).unwrap().map(|b| b.unwrap().rows_seen()).sum();
        assert_eq!(first, 2);
        assert_eq!(second, 2);
    }

    #[test]
    fn stock_row_fields() {
        let file = stock_file(&["AAPL,1500,10.5,11.0,11.25,10.25,1709614800000000000,42".into()]);
        let batch = file.batches(10).unwrap().next().unwrap().unwrap();
        let Records::Stocks(bars) = batch.records else {
            panic!("expected stock records");
        };
        assert_eq!(bars[0].symbol, "AAPL");
        assert_eq!(bars[0].volume, 1500);
        assert_eq!(bars[0].open, 10.5);
        assert_eq!(bars[0].close, 11.0);
        assert_eq!(bars[0].high, 11.25);
        assert_eq!(bars[0].low, 10.25);
        assert_eq!(bars[0].window_start, d(2024, 3, 5));
        assert_eq!(bars[0].transactions, 42);
    }

    #[test]
    fn malformed_rows_are_reported_not_fatal() {
        let file = stock_file(&[
            stock_row("AAPL", 1.0),
            "MSFT,abc,1,1,1,1,1,1".into(),
            "IBM,1,1,1".into(),
            stock_row("GOOG", 2.0),
        ]);
        let batches: Vec<RowBatch> = file.batches(100).unwrap().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 2);
        assert_eq!(batches[0].malformed.len(), 2);
    }

    #[test]
    fn undecodable_option_ticker_is_malformed() {
        let text = format!(
            "{HEADER}O:AAPL210917C00145000,10,1,1,1,1,{TS},2\nO:BAD,10,1,1,1,1,{TS},2\n"
        );
        let file = FlatFile::new(DataKind::Options, d(2024, 3, 5), gz(&text));
        let batch = file.batches(10).unwrap().next().unwrap().unwrap();
        let Records::Options(bars) = &batch.records else {
            panic!("expected option records");
        };
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].identity.underlying_symbol, "AAPL");
        assert_eq!(bars[0].bar.symbol, "O:AAPL210917C00145000");
        assert_eq!(batch.malformed.len(), 1);
        assert!(batch.malformed[0].reason.contains("O:BAD"));
    }

    #[test]
    fn wrong_header_rejected() {
        let file = FlatFile::new(DataKind::Stocks, d(2024, 3, 5), gz("a,b,c\n1,2,3\n"));
        assert!(matches!(
            file.batches(10),
            Err(FlatFileError::UnexpectedHeader { .. })
        ));
    }

    #[test]
    fn corrupt_gzip_is_fatal() {
        let mut bytes = gz(&format!("{HEADER}{}\n", stock_row("AAPL", 1.0)));
        bytes.truncate(bytes.len() / 2);
        let file = FlatFile::new(DataKind::Stocks, d(2024, 3, 5), bytes);
        let outcome: Result<Vec<RowBatch>, FlatFileError> = match file.batches(10) {
            Ok(batches) => batches.collect(),
            Err(e) => Err(e),
        };
        assert!(outcome.is_err());
    }

    #[test]
    fn empty_file_yields_no_batches() {
        let file = stock_file(&[]);
        assert_eq!(file.batches(10).unwrap().count(), 0);
    }

    #[test]
    fn content_hash_is_stable() {
        let a = stock_file(&[stock_row("AAPL", 1.0)]);
        assert_eq!(a.content_hash(), a.clone().content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }
}
