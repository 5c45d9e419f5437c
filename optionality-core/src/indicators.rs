//! Technical indicators over split-adjusted daily bars.
//!
//! Each series has one slot per input bar; a slot is `None` until the
//! lookback window is full. Inputs must be one ticker's bars in date order.

use crate::domain::RawBar;
use chrono::NaiveDate;
use serde::Serialize;

/// Simple moving average over `period` values.
/// Lookback: period - 1 (first value at index period-1).
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return result;
    }

    let mut sum: f64 = values[..period].iter().sum();
    result[period - 1] = Some(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        result[i] = Some(sum / period as f64);
    }
    result
}

/// True range of every bar but the first, which has no previous close.
/// TR[t] = max(high[t]-low[t], |high[t]-close[t-1]|, |low[t]-close[t-1]|).
pub fn true_range(bars: &[RawBar]) -> Vec<Option<f64>> {
    let mut tr = vec![None; bars.len()];
    for (i, pair) in bars.windows(2).enumerate() {
        let (prev, bar) = (&pair[0], &pair[1]);
        let range = (bar.high - bar.low)
            .max((bar.high - prev.close).abs())
            .max((bar.low - prev.close).abs());
        tr[i + 1] = Some(range);
    }
    tr
}

/// Average true range with Wilder smoothing (alpha = 1/period), seeded with
/// the mean of TR[1..=period]. Lookback: period.
pub fn atr(bars: &[RawBar], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; bars.len()];
    if period == 0 || bars.len() <= period {
        return result;
    }
    let tr: Vec<f64> = true_range(bars).into_iter().flatten().collect();

    let mut prev = tr[..period].iter().sum::<f64>() / period as f64;
    result[period] = Some(prev);
    let alpha = 1.0 / period as f64;
    for (slot, value) in result.iter_mut().skip(period + 1).zip(&tr[period..]) {
        prev = alpha * value + (1.0 - alpha) * prev;
        *slot = Some(prev);
    }
    result
}

/// Indicator values of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TechnicalRow {
    pub date: NaiveDate,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub volume_sma_20: Option<f64>,
    pub atr_14: Option<f64>,
}

/// Close SMAs 20/50/200, volume SMA 20 and ATR 14 for every bar.
pub fn technicals(bars: &[RawBar]) -> Vec<TechnicalRow> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume as f64).collect();
    let sma_20 = sma(&closes, 20);
    let sma_50 = sma(&closes, 50);
    let sma_200 = sma(&closes, 200);
    let volume_sma_20 = sma(&volumes, 20);
    let atr_14 = atr(bars, 14);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| TechnicalRow {
            date: bar.window_start,
            sma_20: sma_20[i],
            sma_50: sma_50[i],
            sma_200: sma_200[i],
            volume_sma_20: volume_sma_20[i],
            atr_14: atr_14[i],
        })
        .collect()
}
