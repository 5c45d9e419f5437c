//! RawBar: one daily aggregate row exactly as the vendor delivered it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which of the two daily flat-file families a row or file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Stocks,
    Options,
}

impl DataKind {
    /// Both kinds, in the order `update` loads them.
    pub const ALL: [DataKind; 2] = [DataKind::Stocks, DataKind::Options];

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Stocks => "stocks",
            DataKind::Options => "options",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stocks" => Ok(DataKind::Stocks),
            "options" => Ok(DataKind::Options),
            other => Err(format!("unknown data kind '{other}' (expected stocks or options)")),
        }
    }
}

/// Unadjusted daily OHLCV row. Never modified after ingestion.
///
/// `symbol` is the vendor ticker verbatim: `AAPL` for stocks,
/// `O:AAPL210917C00145000` for options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub symbol: String,
    pub window_start: NaiveDate,
    pub volume: u64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub transactions: u64,
}

impl RawBar {
    /// Returns true if any price is NaN or infinite.
    pub fn is_void(&self) -> bool {
        ![self.open, self.high, self.low, self.close]
            .iter()
            .all(|p| p.is_finite())
    }

    /// Prices are finite and non-negative.
    ///
    /// Flat files occasionally carry bars where high < open (odd-lot prints),
    /// so the range relationship is not enforced here.
    pub fn has_valid_prices(&self) -> bool {
        !self.is_void() && [self.open, self.high, self.low, self.close].iter().all(|p| *p >= 0.0)
    }
}
