//! Optionality runner: ingestion scheduling, reference sync, and verification.
//!
//! This crate builds on `optionality-core` to provide:
//! - Settings from TOML and the environment
//! - Incremental checkpoint tracking
//! - The two-pool ingestion pipeline
//! - Splits and tickers sync
//! - On-demand split-adjusted series
//! - Spot-check verification against the vendor
//! - Store administration and the `update` workflow

pub mod adjusted;
pub mod admin;
pub mod config;
pub mod logging;
pub mod pipeline;
pub mod report;
pub mod sync;
pub mod tracker;
pub mod verify;
pub mod workflow;

pub use adjusted::{adjusted_bars, load_split_history, QueryError};
pub use admin::{clean_store, init_store, store_stats, StoreReport, TableReport};
pub use config::{ConfigError, Requirements, Settings};
pub use pipeline::{
    BatchCounts, BatchReport, DateOutcome, DateReport, FileError, IngestPipeline, IngestProgress,
    LogProgress, PipelineConfig, PipelineError,
};
pub use report::{KindSummary, RunSummary, VerificationSummary};
pub use sync::{
    refresh_tickers, split_history_start, sync_splits, SplitSyncReport, SyncError,
    TickerRefreshReport,
};
pub use tracker::{advance, next_dates_to_load, IncrementalTracker};
pub use verify::{
    check_dates, critical_dates, verify, CheckStatus, SpotCheck, VerificationReport,
    VerifyConfig, VerifyError,
};
pub use workflow::{build_vendor, open_store, run_update, WorkflowError};
