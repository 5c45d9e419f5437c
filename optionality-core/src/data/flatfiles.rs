//! Daily flat-file sources: the vendor's S3-compatible bucket, or a local
//! mirror with the same layout.
//!
//! Object keys: `{prefix}/{YYYY}/{MM}/{YYYY-MM-DD}.csv.gz`.

use super::polygon::PolygonRest;
use super::provider::{VendorApi, VendorError};
use crate::domain::{DataKind, SplitEvent, TickerMetadata};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://files.polygon.io";
pub const DEFAULT_BUCKET: &str = "flatfiles";
pub const STOCKS_PREFIX: &str = "us_stocks_sip/day_aggs_v1";
pub const OPTIONS_PREFIX: &str = "us_options_opra/day_aggs_v1";

/// Where the daily files come from.
pub trait FlatFileSource: Send + Sync {
    /// Location of the file, for logs.
    fn locate(&self, kind: DataKind, date: NaiveDate) -> String;

    fn exists(&self, kind: DataKind, date: NaiveDate) -> Result<bool, VendorError>;

    /// Raw (still gzip-compressed) bytes.
    fn fetch(&self, kind: DataKind, date: NaiveDate) -> Result<Vec<u8>, VendorError>;
}

/// `{prefix}/{YYYY}/{MM}/{YYYY-MM-DD}.csv.gz`
pub fn object_key(prefix: &str, date: NaiveDate) -> String {
    format!(
        "{prefix}/{:04}/{:02}/{date}.csv.gz",
        date.year(),
        date.month()
    )
}

/// Key prefixes per data kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatFilePrefixes {
    pub stocks: String,
    pub options: String,
}

impl FlatFilePrefixes {
    pub fn for_kind(&self, kind: DataKind) -> &str {
        match kind {
            DataKind::Stocks => &self.stocks,
            DataKind::Options => &self.options,
        }
    }
}

impl Default for FlatFilePrefixes {
    fn default() -> Self {
        Self {
            stocks: STOCKS_PREFIX.to_string(),
            options: OPTIONS_PREFIX.to_string(),
        }
    }
}

// ── Local mirror ────────────────────────────────────────────────────

/// Flat files mirrored on disk as `{root}/{stocks|options}/{YYYY}/{MM}/{date}.csv.gz`.
pub struct LocalFlatFiles {
    root: PathBuf,
}

impl LocalFlatFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, kind: DataKind, date: NaiveDate) -> PathBuf {
        self.root.join(object_key(kind.as_str(), date))
    }
}

impl FlatFileSource for LocalFlatFiles {
    fn locate(&self, kind: DataKind, date: NaiveDate) -> String {
        self.path_for(kind, date).display().to_string()
    }

    fn exists(&self, kind: DataKind, date: NaiveDate) -> Result<bool, VendorError> {
        Ok(self.path_for(kind, date).is_file())
    }

    fn fetch(&self, kind: DataKind, date: NaiveDate) -> Result<Vec<u8>, VendorError> {
        let path = self.path_for(kind, date);
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VendorError::NotFound(path.display().to_string()),
            _ => VendorError::Io(e),
        })
    }
}

// ── S3 ──────────────────────────────────────────────────────────────

/// Credentials and location of the vendor's flat-file bucket.
#[derive(Debug, Clone)]
pub struct S3FlatFilesConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub prefixes: FlatFilePrefixes,
}

/// Blocking facade over the async S3 client. Owns a small tokio runtime so
/// callers on rayon threads can use it without an ambient reactor.
pub struct S3FlatFiles {
    client: aws_sdk_s3::Client,
    runtime: tokio::runtime::Runtime,
    bucket: String,
    prefixes: FlatFilePrefixes,
}

impl S3FlatFiles {
    pub fn new(config: S3FlatFilesConfig) -> Result<Self, VendorError> {
        if config.access_key.is_empty() || config.secret_key.is_empty() {
            return Err(VendorError::Configuration(
                "flat-file access key and secret key are required for the S3 source".into(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("s3-io")
            .enable_all()
            .build()
            .map_err(|e| VendorError::Configuration(format!("failed to start I/O runtime: {e}")))?;

        let credentials = Credentials::new(
            config.access_key,
            config.secret_key,
            None,
            None,
            "flatfiles",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .endpoint_url(config.endpoint)
            .region(Region::new("custom"))
            .credentials_provider(credentials)
            .behavior_version(BehaviorVersion::latest())
            .force_path_style(true)
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            runtime,
            bucket: config.bucket,
            prefixes: config.prefixes,
        })
    }

    fn key(&self, kind: DataKind, date: NaiveDate) -> String {
        object_key(self.prefixes.for_kind(kind), date)
    }
}

impl FlatFileSource for S3FlatFiles {
    fn locate(&self, kind: DataKind, date: NaiveDate) -> String {
        format!("s3://{}/{}", self.bucket, self.key(kind, date))
    }

    fn exists(&self, kind: DataKind, date: NaiveDate) -> Result<bool, VendorError> {
        let key = self.key(kind, date);
        let result = self.runtime.block_on(
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send(),
        );
        match result {
            Ok(_) => Ok(true),
            // The bucket answers 403 rather than 404 for files not yet published.
            Err(e) if matches!(status_of(&e), Some(403 | 404)) => {
                debug!(key = %key, "flat file not published");
                Ok(false)
            }
            Err(e) => Err(classify(e, &key)),
        }
    }

    fn fetch(&self, kind: DataKind, date: NaiveDate) -> Result<Vec<u8>, VendorError> {
        let key = self.key(kind, date);
        self.runtime.block_on(async {
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| classify(e, &key))?;
            let body = resp.body.collect().await.map_err(|e| {
                VendorError::NetworkUnreachable(format!("body of {key} interrupted: {e}"))
            })?;
            Ok(body.into_bytes().to_vec())
        })
    }
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

fn classify<E>(err: SdkError<E, HttpResponse>, key: &str) -> VendorError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match status_of(&err) {
        Some(404) => VendorError::NotFound(key.to_string()),
        Some(401 | 403) => VendorError::AuthenticationRequired(format!(
            "flat-file bucket refused {key}; check the access and secret keys"
        )),
        Some(429) => VendorError::RateLimited { retry_after_secs: 1 },
        Some(status) if status >= 500 => VendorError::Server {
            status,
            context: key.to_string(),
        },
        _ => match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                VendorError::NetworkUnreachable(format!("{key}: {}", DisplayErrorContext(&err)))
            }
            other => VendorError::Other(format!("{key}: {}", DisplayErrorContext(&other))),
        },
    }
}

// ── Combined vendor ─────────────────────────────────────────────────

/// The production vendor: flat files from one source, reference data and
/// spot-check prices from the REST API.
pub struct PolygonVendor {
    files: Box<dyn FlatFileSource>,
    rest: PolygonRest,
}

impl PolygonVendor {
    pub fn new(files: Box<dyn FlatFileSource>, rest: PolygonRest) -> Self {
        Self { files, rest }
    }

    pub fn files(&self) -> &dyn FlatFileSource {
        self.files.as_ref()
    }
}

impl VendorApi for PolygonVendor {
    fn name(&self) -> &str {
        "polygon"
    }

    fn file_available(&self, kind: DataKind, date: NaiveDate) -> Result<bool, VendorError> {
        self.files.exists(kind, date)
    }

    fn download_file(&self, kind: DataKind, date: NaiveDate) -> Result<Vec<u8>, VendorError> {
        debug!(source = %self.files.locate(kind, date), "downloading flat file");
        self.files.fetch(kind, date)
    }

    fn list_splits(&self, since: NaiveDate) -> Result<Vec<SplitEvent>, VendorError> {
        self.rest.splits_since(since)
    }

    fn list_tickers(&self) -> Result<Vec<TickerMetadata>, VendorError> {
        self.rest.tickers()
    }

    fn adjusted_close(&self, ticker: &str, date: NaiveDate) -> Result<Option<f64>, VendorError> {
        self.rest.adjusted_close(ticker, date)
    }
}
