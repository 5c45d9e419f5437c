//! Corporate split events.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SplitError {
    #[error("split {id} for {ticker}: ratio {split_from}:{split_to} must be positive integers")]
    InvalidRatio {
        id: String,
        ticker: String,
        split_from: f64,
        split_to: f64,
    },

    #[error("split {id}: empty ticker")]
    EmptyTicker { id: String },
}

/// A split: `split_from` old shares became `split_to` new shares at the
/// open of `execution_date`. A 1:4 forward split has factor 4.0, a 10:1
/// reverse split has factor 0.1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitEvent {
    pub id: String,
    pub ticker: String,
    pub execution_date: NaiveDate,
    split_from: u32,
    split_to: u32,
}

impl SplitEvent {
    pub fn new(
        id: impl Into<String>,
        ticker: impl Into<String>,
        execution_date: NaiveDate,
        split_from: u32,
        split_to: u32,
    ) -> Result<Self, SplitError> {
        let id = id.into();
        let ticker = ticker.into();
        if ticker.is_empty() {
            return Err(SplitError::EmptyTicker { id });
        }
        if split_from == 0 || split_to == 0 {
            return Err(SplitError::InvalidRatio {
                id,
                ticker,
                split_from: f64::from(split_from),
                split_to: f64::from(split_to),
            });
        }
        Ok(Self {
            id,
            ticker,
            execution_date,
            split_from,
            split_to,
        })
    }

    /// Build from the vendor's numeric ratio fields, which arrive as floats.
    /// Fractional or non-positive ratios are rejected.
    pub fn from_vendor_ratio(
        id: impl Into<String>,
        ticker: impl Into<String>,
        execution_date: NaiveDate,
        split_from: f64,
        split_to: f64,
    ) -> Result<Self, SplitError> {
        let id = id.into();
        let ticker = ticker.into();
        let whole = |v: f64| v.is_finite() && v >= 1.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX);
        if !whole(split_from) || !whole(split_to) {
            return Err(SplitError::InvalidRatio {
                id,
                ticker,
                split_from,
                split_to,
            });
        }
        Self::new(id, ticker, execution_date, split_from as u32, split_to as u32)
    }

    pub fn split_from(&self) -> u32 {
        self.split_from
    }

    pub fn split_to(&self) -> u32 {
        self.split_to
    }

    /// `split_to / split_from`. Always positive.
    pub fn split_factor(&self) -> f64 {
        f64::from(self.split_to) / f64::from(self.split_from)
    }

    pub fn is_reverse(&self) -> bool {
        self.split_to < self.split_from
    }

    /// Human-readable ratio, e.g. `4-for-1` or `1-for-10 (reverse)`.
    pub fn describe_ratio(&self) -> String {
        if self.is_reverse() {
            format!("{}-for-{} (reverse)", self.split_to, self.split_from)
        } else {
            format!("{}-for-{}", self.split_to, self.split_from)
        }
    }
}
