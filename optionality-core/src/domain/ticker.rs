//! Reference metadata for listed tickers.

use serde::{Deserialize, Serialize};

/// One row of the tickers table. Refreshed wholesale, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerMetadata {
    pub ticker: String,
    pub name: Option<String>,
    pub market: Option<String>,
    pub locale: Option<String>,
    pub primary_exchange: Option<String>,
    pub ticker_type: Option<String>,
    pub active: bool,
    pub currency_name: Option<String>,
    pub cik: Option<String>,
    pub composite_figi: Option<String>,
    pub share_class_figi: Option<String>,
    /// ISO-8601 timestamp as delivered by the vendor.
    pub last_updated_utc: Option<String>,
    pub delisted_utc: Option<String>,
}

impl TickerMetadata {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            name: None,
            market: None,
            locale: None,
            primary_exchange: None,
            ticker_type: None,
            active: true,
            currency_name: None,
            cik: None,
            composite_figi: None,
            share_class_figi: None,
            last_updated_utc: None,
            delisted_utc: None,
        }
    }
}

/// A plausible equity symbol: 1-10 chars of uppercase letters, digits, `.` or `-`,
/// starting with a letter.
pub fn is_valid_symbol(symbol: &str) -> bool {
    let bytes = symbol.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 10
        && bytes[0].is_ascii_uppercase()
        && bytes
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == b'.' || *b == b'-')
}
