//! Split adjustment computed at read time.
//!
//! A split executing on day E affects every price dated on or before E
//! (E itself is included because the flat files for the execution date are
//! published with pre-split prices). For a price on date D the cumulative
//! factor is the product of `split_factor` over every split of that ticker
//! with `execution_date >= D`, and the adjusted price is `raw / factor`.
//! Volume is never adjusted.

use crate::domain::{RawBar, SplitEvent};
use chrono::NaiveDate;
use std::collections::HashMap;

/// Product of split factors for splits executing on or after `date`.
/// Returns 1.0 when no split applies.
pub fn cumulative_factor(splits: &[SplitEvent], date: NaiveDate) -> f64 {
    splits
        .iter()
        .filter(|s| s.execution_date >= date)
        .map(SplitEvent::split_factor)
        .product()
}

pub fn adjust_price(raw_price: f64, splits: &[SplitEvent], date: NaiveDate) -> f64 {
    raw_price / cumulative_factor(splits, date)
}

/// Adjusted copy of `bar`. OHLC are divided by the cumulative factor;
/// volume and transactions are carried through unchanged.
pub fn adjust_bar(bar: &RawBar, splits: &[SplitEvent]) -> RawBar {
    let factor = cumulative_factor(splits, bar.window_start);
    RawBar {
        symbol: bar.symbol.clone(),
        window_start: bar.window_start,
        volume: bar.volume,
        open: bar.open / factor,
        close: bar.close / factor,
        high: bar.high / factor,
        low: bar.low / factor,
        transactions: bar.transactions,
    }
}

/// Split events grouped by ticker, each group sorted by execution date.
#[derive(Debug, Clone, Default)]
pub struct SplitHistory {
    by_ticker: HashMap<String, Vec<SplitEvent>>,
}

impl SplitHistory {
    pub fn from_events(events: impl IntoIterator<Item = SplitEvent>) -> Self {
        let mut by_ticker: HashMap<String, Vec<SplitEvent>> = HashMap::new();
        for event in events {
            by_ticker.entry(event.ticker.clone()).or_default().push(event);
        }
        for splits in by_ticker.values_mut() {
            splits.sort_by(|a, b| a.execution_date.cmp(&b.execution_date).then(a.id.cmp(&b.id)));
        }
        Self { by_ticker }
    }

    /// Splits for `ticker`, oldest first. Empty if it never split.
    pub fn for_ticker(&self, ticker: &str) -> &[SplitEvent] {
        self.by_ticker.get(ticker).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tickers with at least one split, sorted.
    pub fn tickers(&self) -> Vec<&str> {
        let mut tickers: Vec<&str> = self.by_ticker.keys().map(String::as_str).collect();
        tickers.sort_unstable();
        tickers
    }

    pub fn len(&self) -> usize {
        self.by_ticker.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ticker.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SplitEvent> {
        self.by_ticker.values().flatten()
    }

    /// Adjust a bar using the splits of its own symbol.
    pub fn adjust(&self, bar: &RawBar) -> RawBar {
        adjust_bar(bar, self.for_ticker(&bar.symbol))
    }
}
