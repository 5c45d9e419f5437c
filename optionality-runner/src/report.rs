//! Structured summary of an `update` run.

use chrono::{DateTime, NaiveDate, Utc};
use optionality_core::domain::{DataKind, IngestionCheckpoint};
use serde::Serialize;

use crate::pipeline::{BatchCounts, BatchReport};
use crate::sync::SplitSyncReport;
use crate::verify::{SpotCheck, VerificationReport};

#[derive(Debug, Clone, Serialize)]
pub struct DateFailure {
    pub date: NaiveDate,
    pub error: String,
}

/// Ingestion result for one data kind.
#[derive(Debug, Clone, Serialize)]
pub struct KindSummary {
    pub kind: DataKind,
    pub checkpoint_before: Option<NaiveDate>,
    pub checkpoint_after: Option<NaiveDate>,
    /// Dates behind the checkpoint that were retried.
    pub backfilled: Vec<NaiveDate>,
    pub counts: BatchCounts,
    pub failures: Vec<DateFailure>,
}

impl KindSummary {
    pub fn new(
        before: &IngestionCheckpoint,
        after: &IngestionCheckpoint,
        report: &BatchReport,
    ) -> Self {
        Self {
            kind: report.kind,
            checkpoint_before: before.last_loaded_date,
            checkpoint_after: after.last_loaded_date,
            backfilled: report
                .dates
                .iter()
                .map(|d| d.date)
                .filter(|&date| before.covers(date))
                .collect(),
            counts: report.counts(),
            failures: report
                .failures()
                .into_iter()
                .map(|(date, error)| DateFailure { date, error })
                .collect(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.counts.failed == 0 && self.counts.cancelled == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationSummary {
    pub sampled_tickers: Vec<String>,
    pub tolerance: f64,
    pub comparisons: usize,
    pub passed: usize,
    pub failed: usize,
    pub no_data: usize,
    pub errors: usize,
    /// Failed and errored comparisons.
    pub problems: Vec<SpotCheck>,
}

impl From<&VerificationReport> for VerificationSummary {
    fn from(r: &VerificationReport) -> Self {
        Self {
            sampled_tickers: r.sampled_tickers.clone(),
            tolerance: r.tolerance,
            comparisons: r.checks.len(),
            passed: r.passed(),
            failed: r.failed(),
            no_data: r.no_data(),
            errors: r.errors(),
            problems: r.problems().cloned().collect(),
        }
    }
}

impl VerificationSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub splits: Option<SplitSyncReport>,
    pub kinds: Vec<KindSummary>,
    pub verification: Option<VerificationSummary>,
    /// Contained failures outside any single date, such as a failed split
    /// sync or availability check.
    pub errors: Vec<String>,
}

impl RunSummary {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            splits: None,
            kinds: Vec::new(),
            verification: None,
            errors: Vec::new(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
            && self.kinds.iter().all(KindSummary::is_success)
            && self
                .verification
                .as_ref()
                .map_or(true, VerificationSummary::is_success)
    }

    pub fn rows_committed(&self) -> u64 {
        self.kinds.iter().map(|k| k.counts.rows).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{DateOutcome, DateReport, FileError};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn kind_summary_collects_failures() {
        let before = IngestionCheckpoint::empty(DataKind::Options);
        let report = BatchReport {
            kind: DataKind::Options,
            dates: vec![
                DateReport {
                    date: d(4),
                    outcome: DateOutcome::Committed {
                        rows: 3,
                        skipped_rows: 0,
                        partitions: 1,
                    },
                },
                DateReport {
                    date: d(5),
                    outcome: DateOutcome::Failed(FileError::ErrorRateExceeded {
                        malformed: 9,
                        seen: 10,
                    }),
                },
            ],
        };
        let summary = KindSummary::new(&before, &before, &report);
        assert!(!summary.is_success());
        assert!(summary.backfilled.is_empty());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].date, d(5));
        assert_eq!(summary.counts.rows, 3);
    }

    #[test]
    fn run_summary_success_rules() {
        let mut summary = RunSummary::start();
        assert!(summary.is_success());
        summary.errors.push("split sync failed".into());
        assert!(!summary.is_success());

        let json = serde_json::to_string(&summary.finish()).unwrap();
        assert!(json.contains("split sync failed"));
        assert!(!json.contains("tickers"));
    }

    #[test]
    fn dates_behind_the_checkpoint_count_as_backfill() {
        let before = IngestionCheckpoint::empty(DataKind::Stocks).advanced_to(d(6));
        let report = BatchReport {
            kind: DataKind::Stocks,
            dates: [5, 7]
                .into_iter()
                .map(|day| DateReport {
                    date: d(day),
                    outcome: DateOutcome::Committed {
                        rows: 1,
                        skipped_rows: 0,
                        partitions: 1,
                    },
                })
                .collect(),
        };
        let after = before.advanced_to(d(7));
        let summary = KindSummary::new(&before, &after, &report);
        assert_eq!(summary.backfilled, vec![d(5)]);
        assert_eq!(summary.checkpoint_after, Some(d(7)));
    }
}
