//! Spot-check of split-adjusted prices against the vendor's own adjustment.
//!
//! A random sample of tickers with a recent split is drawn. For each, the
//! locally adjusted close on the three sessions around every split, plus one
//! date well before the earliest of them, is compared with the vendor's
//! adjusted close. Every comparison runs; one failure fails the run.

use chrono::{Duration, NaiveDate};
use optionality_core::data::{ColumnarStore, VendorApi};
use optionality_core::domain::{RawBar, SplitEvent};
use optionality_core::SplitHistory;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adjusted::{load_split_history, raw_bars, QueryError};
use crate::config::VerifySettings;

/// Days before the earliest split used for the quiet-period check.
pub const PRE_SPLIT_OFFSET_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to load split history: {0}")]
    History(#[from] QueryError),

    #[error("failed to build reference pool: {0}")]
    ThreadPool(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyConfig {
    pub sample_size: usize,
    /// Relative tolerance, 0.001 = 0.1%.
    pub tolerance: f64,
    pub lookback_days: i64,
    pub reference_concurrency: usize,
    pub seed: Option<u64>,
}

impl VerifyConfig {
    /// Config for `verify`, or for the spot check inside `update`.
    pub fn from_settings(s: &VerifySettings, for_update: bool) -> Self {
        Self {
            sample_size: if for_update {
                s.update_sample_size
            } else {
                s.sample_size
            },
            tolerance: s.tolerance,
            lookback_days: s.lookback_days,
            reference_concurrency: s.reference_concurrency.max(1),
            seed: s.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    /// Nothing to compare: no local bar or no vendor bar for the session.
    NoData(String),
    Error(String),
}

/// One `(ticker, date)` comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotCheck {
    pub ticker: String,
    pub date: NaiveDate,
    pub raw_close: Option<f64>,
    pub local_adjusted: Option<f64>,
    pub reference: Option<f64>,
    /// `local_adjusted - reference`
    pub diff: Option<f64>,
    pub rel_diff: Option<f64>,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub sampled_tickers: Vec<String>,
    pub tolerance: f64,
    pub checks: Vec<SpotCheck>,
}

impl VerificationReport {
    fn count(&self, f: impl Fn(&CheckStatus) -> bool) -> usize {
        self.checks.iter().filter(|c| f(&c.status)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Pass))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Fail))
    }

    pub fn no_data(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::NoData(_)))
    }

    pub fn errors(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Error(_)))
    }

    /// No comparison failed or errored.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.errors() == 0
    }

    pub fn problems(&self) -> impl Iterator<Item = &SpotCheck> {
        self.checks
            .iter()
            .filter(|c| matches!(c.status, CheckStatus::Fail | CheckStatus::Error(_)))
    }
}

/// Day before, day of, and day after a split's execution.
pub fn critical_dates(execution_date: NaiveDate) -> [NaiveDate; 3] {
    [
        execution_date - Duration::days(1),
        execution_date,
        execution_date + Duration::days(1),
    ]
}

/// Dates to check for one ticker: the critical dates of every split plus
/// one date [`PRE_SPLIT_OFFSET_DAYS`] before the earliest split. Sorted,
/// without duplicates.
pub fn check_dates(splits: &[SplitEvent]) -> Vec<NaiveDate> {
    let Some(earliest) = splits.iter().map(|s| s.execution_date).min() else {
        return Vec::new();
    };
    let mut dates = vec![earliest - Duration::days(PRE_SPLIT_OFFSET_DAYS)];
    for split in splits {
        dates.extend(critical_dates(split.execution_date));
    }
    dates.sort();
    dates.dedup();
    dates
}

/// Draw up to `sample_size` tickers with a split executed within
/// `lookback_days` of `today`. Sorted for stable reporting.
pub fn sample_tickers(
    history: &SplitHistory,
    today: NaiveDate,
    lookback_days: i64,
    sample_size: usize,
    rng: &mut StdRng,
) -> Vec<String> {
    let since = today - Duration::days(lookback_days);
    let eligible: Vec<&str> = history
        .tickers()
        .into_iter()
        .filter(|t| {
            history
                .for_ticker(t)
                .iter()
                .any(|s| s.execution_date >= since && s.execution_date <= today)
        })
        .collect();

    let mut sampled: Vec<String> = eligible
        .choose_multiple(rng, sample_size)
        .map(|t| t.to_string())
        .collect();
    sampled.sort();
    sampled
}

/// Relative difference of `local` from `reference`.
pub fn relative_diff(local: f64, reference: f64) -> f64 {
    if reference == 0.0 {
        if local == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (local - reference).abs() / reference.abs()
    }
}

/// Run the spot check. Fails as a whole only if the split history cannot
/// be read; every per-comparison problem is recorded in the report.
pub fn verify(
    vendor: &dyn VendorApi,
    store: &dyn ColumnarStore,
    config: &VerifyConfig,
    today: NaiveDate,
) -> Result<VerificationReport, VerifyError> {
    let history = load_split_history(store)?;
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let sampled = sample_tickers(
        &history,
        today,
        config.lookback_days,
        config.sample_size,
        &mut rng,
    );
    if sampled.is_empty() {
        warn!(lookback_days = config.lookback_days, "no tickers with recent splits to verify");
    }

    let since = today - Duration::days(config.lookback_days);
    let mut pending = Vec::new();
    for ticker in &sampled {
        let recent: Vec<SplitEvent> = history
            .for_ticker(ticker)
            .iter()
            .filter(|s| s.execution_date >= since && s.execution_date <= today)
            .cloned()
            .collect();
        let dates = check_dates(&recent);
        pending.extend(local_side(&history, store, ticker, &dates));
    }
    info!(tickers = sampled.len(), comparisons = pending.len(), "verifying adjusted prices");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.reference_concurrency)
        .thread_name(|i| format!("reference-{i}"))
        .build()
        .map_err(|e| VerifyError::ThreadPool(e.to_string()))?;

    let checks: Vec<SpotCheck> = pool.install(|| {
        pending
            .into_par_iter()
            .map(|check| compare(vendor, check, config.tolerance))
            .collect()
    });

    let report = VerificationReport {
        sampled_tickers: sampled,
        tolerance: config.tolerance,
        checks,
    };
    info!(
        passed = report.passed(),
        failed = report.failed(),
        no_data = report.no_data(),
        errors = report.errors(),
        "verification complete"
    );
    Ok(report)
}

/// Local adjusted closes for `dates`. Checks without a local answer come
/// back already settled.
fn local_side(
    history: &SplitHistory,
    store: &dyn ColumnarStore,
    ticker: &str,
    dates: &[NaiveDate],
) -> Vec<SpotCheck> {
    let blank = |date: NaiveDate, status: CheckStatus| SpotCheck {
        ticker: ticker.to_string(),
        date,
        raw_close: None,
        local_adjusted: None,
        reference: None,
        diff: None,
        rel_diff: None,
        status,
    };
    let (Some(&first), Some(&last)) = (dates.first(), dates.last()) else {
        return Vec::new();
    };

    let bars: HashMap<NaiveDate, RawBar> = match raw_bars(store, ticker, first, last) {
        Ok(bars) => bars.into_iter().map(|b| (b.window_start, b)).collect(),
        Err(e) => {
            let msg = format!("reading local bars: {e}");
            return dates
                .iter()
                .map(|&d| blank(d, CheckStatus::Error(msg.clone())))
                .collect();
        }
    };

    dates
        .iter()
        .map(|&date| match bars.get(&date) {
            Some(bar) => {
                let adjusted = history.adjust(bar);
                SpotCheck {
                    raw_close: Some(bar.close),
                    local_adjusted: Some(adjusted.close),
                    ..blank(date, CheckStatus::Pass)
                }
            }
            None => blank(date, CheckStatus::NoData("no local bar".into())),
        })
        .collect()
}

/// Fill in the vendor side of a check that has a local price.
fn compare(vendor: &dyn VendorApi, mut check: SpotCheck, tolerance: f64) -> SpotCheck {
    let Some(local) = check.local_adjusted else {
        return check;
    };
    match vendor.adjusted_close(&check.ticker, check.date) {
        Ok(Some(reference)) => {
            let rel = relative_diff(local, reference);
            check.reference = Some(reference);
            check.diff = Some(local - reference);
            check.rel_diff = Some(rel);
            check.status = if rel <= tolerance {
                CheckStatus::Pass
            } else {
                warn!(
                    ticker = %check.ticker, date = %check.date, local, reference, rel,
                    "adjusted close mismatch"
                );
                CheckStatus::Fail
            };
        }
        Ok(None) => {
            debug!(ticker = %check.ticker, date = %check.date, "vendor has no bar");
            check.status = CheckStatus::NoData("no vendor bar".into());
        }
        Err(e) => check.status = CheckStatus::Error(e.to_string()),
    }
    check
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn split(ticker: &str, date: NaiveDate) -> SplitEvent {
        SplitEvent::new(format!("{ticker}-{date}"), ticker, date, 1, 4).unwrap()
    }

    #[test]
    fn critical_dates_bracket_execution_day() {
        assert_eq!(
            critical_dates(d(2020, 8, 31)),
            [d(2020, 8, 30), d(2020, 8, 31), d(2020, 9, 1)]
        );
    }

    #[test]
    fn check_dates_include_quiet_period_before_earliest_split() {
        let dates = check_dates(&[split("AAPL", d(2020, 8, 31))]);
        assert_eq!(
            dates,
            vec![d(2020, 8, 1), d(2020, 8, 30), d(2020, 8, 31), d(2020, 9, 1)]
        );
    }

    #[test]
    fn check_dates_merge_adjacent_splits() {
        let dates = check_dates(&[split("X", d(2024, 1, 10)), split("X", d(2024, 1, 11))]);
        assert_eq!(
            dates,
            vec![
                d(2023, 12, 11),
                d(2024, 1, 9),
                d(2024, 1, 10),
                d(2024, 1, 11),
                d(2024, 1, 12)
            ]
        );
        assert!(check_dates(&[]).is_empty());
    }

    #[test]
    fn sampling_only_draws_recent_splitters() {
        let history = SplitHistory::from_events(vec![
            split("OLD", d(2019, 1, 2)),
            split("NEW", d(2024, 5, 1)),
            split("NEWER", d(2024, 6, 3)),
        ]);
        let mut rng = StdRng::seed_from_u64(7);
        let sampled = sample_tickers(&history, d(2024, 6, 30), 365, 10, &mut rng);
        assert_eq!(sampled, vec!["NEW".to_string(), "NEWER".to_string()]);
    }

    #[test]
    fn sampling_respects_size_and_seed() {
        let events: Vec<SplitEvent> = (0..20)
            .map(|i| split(&format!("T{i:02}"), d(2024, 5, 1)))
            .collect();
        let history = SplitHistory::from_events(events);
        let a = sample_tickers(&history, d(2024, 6, 30), 365, 5, &mut StdRng::seed_from_u64(1));
        let b = sample_tickers(&history, d(2024, 6, 30), 365, 5, &mut StdRng::seed_from_u64(1));
        assert_eq!(a.len(), 5);
        assert_eq!(a, b);
    }

    #[test]
    fn relative_diff_handles_zero_reference() {
        assert_eq!(relative_diff(0.0, 0.0), 0.0);
        assert!(relative_diff(1.0, 0.0).is_infinite());
        assert!((relative_diff(100.1, 100.0) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn report_success_ignores_missing_data() {
        let base = SpotCheck {
            ticker: "AAPL".into(),
            date: d(2020, 8, 30),
            raw_close: None,
            local_adjusted: None,
            reference: None,
            diff: None,
            rel_diff: None,
            status: CheckStatus::NoData("no local bar".into()),
        };
        let mut report = VerificationReport {
            sampled_tickers: vec!["AAPL".into()],
            tolerance: 0.001,
            checks: vec![base.clone()],
        };
        assert!(report.is_success());

        report.checks.push(SpotCheck {
            status: CheckStatus::Fail,
            ..base
        });
        assert!(!report.is_success());
        assert_eq!(report.problems().count(), 1);
    }
}
