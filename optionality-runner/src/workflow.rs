//! The `update` workflow and vendor/store construction from settings.
//!
//! Order: splits sync, stocks, options, spot check. Each kind's batch is the
//! uncommitted weekdays just behind its checkpoint followed by the new ones.
//! Each step's failures are contained in the summary; only configuration and
//! authentication problems abort the run.

use chrono::NaiveDate;
use optionality_core::data::{
    CheckpointLog, CircuitBreaker, ColumnarStore, FlatFilePrefixes, FlatFileSource,
    LocalFlatFiles, ParquetStore, PolygonRest, PolygonRestConfig, PolygonVendor, S3FlatFiles,
    S3FlatFilesConfig, VendorApi, VendorError,
};
use optionality_core::domain::DataKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{FlatFileSourceKind, Settings};
use crate::pipeline::{IngestPipeline, IngestProgress, PipelineConfig, PipelineError};
use crate::report::{KindSummary, RunSummary, VerificationSummary};
use crate::sync::{split_history_start, sync_splits, SyncError};
use crate::tracker::{
    latest_available, missing_dates, next_dates_to_load, IncrementalTracker,
};
use crate::verify::{verify, VerifyConfig};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("vendor setup failed: {0}")]
    Vendor(VendorError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Store and state log rooted at the configured storage path.
pub fn open_store(settings: &Settings) -> (ParquetStore, CheckpointLog) {
    let root = &settings.storage.path;
    (ParquetStore::new(root), CheckpointLog::new(root))
}

/// The configured flat-file source.
pub fn build_flat_files(settings: &Settings) -> Result<Box<dyn FlatFileSource>, VendorError> {
    let f = &settings.flatfiles;
    Ok(match f.source {
        FlatFileSourceKind::Local => Box::new(LocalFlatFiles::new(&f.local_path)),
        FlatFileSourceKind::S3 => Box::new(S3FlatFiles::new(S3FlatFilesConfig {
            endpoint: f.endpoint.clone(),
            bucket: f.bucket.clone(),
            access_key: f.access_key.clone(),
            secret_key: f.secret_key.clone(),
            prefixes: FlatFilePrefixes {
                stocks: f.stocks_prefix.clone(),
                options: f.options_prefix.clone(),
            },
        })?),
    })
}

/// REST client plus flat-file source.
pub fn build_vendor(settings: &Settings) -> Result<PolygonVendor, VendorError> {
    let v = &settings.vendor;
    let rest = PolygonRest::new(
        PolygonRestConfig {
            base_url: v.base_url.clone(),
            timeout: Duration::from_secs(v.timeout_secs),
            max_retries: v.max_retries,
            base_delay: Duration::from_millis(v.retry_base_delay_ms),
            ..PolygonRestConfig::new(v.api_key.clone())
        },
        Arc::new(CircuitBreaker::default_vendor()),
    )?;
    Ok(PolygonVendor::new(build_flat_files(settings)?, rest))
}

/// Errors that make every further vendor call pointless.
fn is_fatal(e: &VendorError) -> bool {
    matches!(
        e,
        VendorError::AuthenticationRequired(_) | VendorError::Configuration(_)
    )
}

/// Sync splits, load new stocks and options dates through `through`, then
/// spot-check adjusted prices.
pub fn run_update(
    vendor: &dyn VendorApi,
    store: &dyn ColumnarStore,
    log: &CheckpointLog,
    settings: &Settings,
    through: NaiveDate,
    today: NaiveDate,
    progress: &dyn IngestProgress,
) -> Result<RunSummary, WorkflowError> {
    let mut summary = RunSummary::start();
    let history_start = settings.pipeline.history_start_for(today);
    info!(vendor = vendor.name(), %history_start, %through, "update started");

    match split_history_start(log, history_start) {
        Ok(since) => match sync_splits(vendor, store, since) {
            Ok(report) => summary.splits = Some(report),
            Err(SyncError::Vendor(e)) if is_fatal(&e) => return Err(WorkflowError::Vendor(e)),
            Err(e) => {
                error!(error = %e, "split sync failed");
                summary.errors.push(format!("split sync: {e}"));
            }
        },
        Err(e) => {
            error!(error = %e, "cannot read commit records, splits left as they are");
            summary.errors.push(format!("split sync: {e}"));
        }
    }

    let pipeline = IngestPipeline::new(
        vendor,
        store,
        log,
        PipelineConfig::from(&settings.pipeline),
    )?;
    let tracker = IncrementalTracker::new(log);

    for kind in DataKind::ALL {
        let available = match latest_available(vendor, kind, through) {
            Ok(found) => found,
            Err(e) if is_fatal(&e) => return Err(WorkflowError::Vendor(e)),
            Err(e) => {
                error!(%kind, error = %e, "availability check failed");
                summary.errors.push(format!("{kind} availability: {e}"));
                continue;
            }
        };
        let before = match tracker.checkpoint(kind) {
            Ok(cp) => cp,
            Err(e) => {
                error!(%kind, error = %e, "cannot read checkpoint");
                summary.errors.push(format!("{kind} checkpoint: {e}"));
                continue;
            }
        };
        let backfill_from = before
            .last_loaded_date
            .map_or(history_start, |last| {
                last - chrono::Duration::days(settings.pipeline.backfill_days)
            })
            .max(history_start);
        let mut dates = match missing_dates(log, &before, backfill_from) {
            Ok(gaps) => gaps,
            Err(e) => {
                error!(%kind, error = %e, "cannot read commit records, skipping backfill");
                summary.errors.push(format!("{kind} backfill: {e}"));
                Vec::new()
            }
        };
        if !dates.is_empty() {
            info!(%kind, dates = dates.len(), "retrying uncommitted dates behind the checkpoint");
        }
        match available {
            Some(latest) => dates.extend(next_dates_to_load(&before, history_start, latest)),
            None => warn!(%kind, %through, "no published file found near the target date"),
        }
        if dates.is_empty() {
            info!(%kind, checkpoint = ?before.last_loaded_date, "nothing new to load");
        }

        let report = pipeline.run(kind, &dates, progress);
        let after = match tracker.commit_batch(&before, &report) {
            Ok(after) => after,
            Err(e) => {
                error!(%kind, error = %e, "failed to save checkpoint");
                summary.errors.push(format!("{kind} checkpoint: {e}"));
                before
            }
        };
        summary.kinds.push(KindSummary::new(&before, &after, &report));
    }

    let config = VerifyConfig::from_settings(&settings.verify, true);
    match verify(vendor, store, &config, today) {
        Ok(report) => summary.verification = Some(VerificationSummary::from(&report)),
        Err(e) => {
            error!(error = %e, "verification could not run");
            summary.errors.push(format!("verification: {e}"));
        }
    }

    let summary = summary.finish();
    info!(
        success = summary.is_success(),
        rows = summary.rows_committed(),
        "update finished"
    );
    Ok(summary)
}
