//! Per-kind ingestion checkpoint.

use super::bar::DataKind;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Latest date for which every file of `kind` is fully committed.
///
/// Value object: advancing returns a new checkpoint and never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCheckpoint {
    pub kind: DataKind,
    pub last_loaded_date: Option<NaiveDate>,
}

impl IngestionCheckpoint {
    /// Checkpoint for a kind that has never been loaded.
    pub fn empty(kind: DataKind) -> Self {
        Self {
            kind,
            last_loaded_date: None,
        }
    }

    /// Whether `date` is at or before the checkpoint.
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.last_loaded_date.is_some_and(|last| date <= last)
    }

    /// The checkpoint moved forward to `date`, or unchanged if `date` is not later.
    pub fn advanced_to(&self, date: NaiveDate) -> Self {
        let last_loaded_date = match self.last_loaded_date {
            Some(last) if last >= date => Some(last),
            _ => Some(date),
        };
        Self {
            kind: self.kind,
            last_loaded_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn empty_covers_nothing() {
        let cp = IngestionCheckpoint::empty(DataKind::Stocks);
        assert!(!cp.covers(d(1)));
    }

    #[test]
    fn advance_is_monotonic() {
        let cp = IngestionCheckpoint::empty(DataKind::Options).advanced_to(d(10));
        assert_eq!(cp.last_loaded_date, Some(d(10)));
        assert_eq!(cp.advanced_to(d(5)).last_loaded_date, Some(d(10)));
        assert_eq!(cp.advanced_to(d(12)).last_loaded_date, Some(d(12)));
        assert!(cp.covers(d(10)));
        assert!(!cp.covers(d(11)));
    }
}
