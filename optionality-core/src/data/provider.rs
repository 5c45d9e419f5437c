//! Vendor trait and structured error types.
//!
//! `VendorApi` abstracts the market data vendor (daily flat files plus the
//! reference REST endpoints) so the pipeline and verifier can run against an
//! in-memory double in tests.

use crate::domain::{DataKind, SplitEvent, TickerMetadata};
use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by vendor (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("vendor server error (HTTP {status}): {context}")]
    Server { status: u16, context: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication failed: {0}")]
    AuthenticationRequired(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("hard stop: vendor is refusing requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("vendor client misconfigured: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vendor error: {0}")]
    Other(String),
}

impl VendorError {
    /// Errors worth retrying with backoff. Everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VendorError::NetworkUnreachable(_)
                | VendorError::RateLimited { .. }
                | VendorError::Server { .. }
        )
    }
}

/// `base * 2^retry`, capped at [`MAX_BACKOFF`]. `retry` counts from 0.
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    2u32.checked_pow(retry)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

/// Everything the ingestion, sync and verification paths need from the vendor.
pub trait VendorApi: Send + Sync {
    /// Human-readable name of this vendor.
    fn name(&self) -> &str;

    /// Whether the daily file for `date` has been published.
    fn file_available(&self, kind: DataKind, date: NaiveDate) -> Result<bool, VendorError>;

    /// Gzip-compressed CSV bytes of the daily file.
    fn download_file(&self, kind: DataKind, date: NaiveDate) -> Result<Vec<u8>, VendorError>;

    /// All splits executing on or after `since`. Invalid records are dropped.
    fn list_splits(&self, since: NaiveDate) -> Result<Vec<SplitEvent>, VendorError>;

    /// Reference metadata for every listed stock ticker.
    fn list_tickers(&self) -> Result<Vec<TickerMetadata>, VendorError>;

    /// The vendor's own split-adjusted close, or `None` if it has no bar
    /// for that ticker and date.
    fn adjusted_close(&self, ticker: &str, date: NaiveDate) -> Result<Option<f64>, VendorError>;
}
