//! Settings: TOML file with serde defaults, overlaid by environment variables.
//!
//! Lookup order for the file: `--config <path>` if given, otherwise
//! `optionality.toml` in the working directory if present, otherwise pure
//! defaults. A `.env` file is honoured for the environment overlay.

use chrono::NaiveDate;
use optionality_core::data::flatfiles::{
    DEFAULT_BUCKET, DEFAULT_ENDPOINT, OPTIONS_PREFIX, STOCKS_PREFIX,
};
use optionality_core::data::polygon::DEFAULT_BASE_URL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "optionality.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing required setting {key} (set {env} or [{section}] in the config file)")]
    Missing {
        key: &'static str,
        env: &'static str,
        section: &'static str,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub vendor: VendorSettings,
    pub flatfiles: FlatFileSettings,
    pub storage: StorageSettings,
    pub pipeline: PipelineSettings,
    pub verify: VerifySettings,
}

/// REST API access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VendorSettings {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for VendorSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlatFileSourceKind {
    S3,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlatFileSettings {
    pub source: FlatFileSourceKind,
    pub endpoint: String,
    pub bucket: String,
    pub stocks_prefix: String,
    pub options_prefix: String,
    pub access_key: String,
    pub secret_key: String,
    /// Root of the local mirror when `source = "local"`.
    pub local_path: PathBuf,
}

impl Default for FlatFileSettings {
    fn default() -> Self {
        Self {
            source: FlatFileSourceKind::S3,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            stocks_prefix: STOCKS_PREFIX.to_string(),
            options_prefix: OPTIONS_PREFIX.to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            local_path: PathBuf::from("flatfiles"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    pub download_concurrency: usize,
    pub processing_concurrency: usize,
    /// Rows per batch when decoding a file.
    pub batch_size: usize,
    /// Extra attempts after the first for transient download errors.
    pub download_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Fraction of malformed rows above which a file is rejected.
    pub max_row_error_rate: f64,
    /// Rows seen before the error rate is checked mid-file.
    pub min_rows_for_error_rate: usize,
    /// Malformed rows logged individually per file.
    pub log_malformed_rows: usize,
    /// Fraction of failed dates after which remaining work is cancelled.
    pub max_failed_fraction: f64,
    /// First date loaded when a kind has no checkpoint. Defaults to two
    /// years before the run date.
    pub history_start: Option<NaiveDate>,
    /// Days before the checkpoint searched for weekdays that never
    /// committed. 0 disables backfill.
    pub backfill_days: i64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            download_concurrency: 2,
            processing_concurrency: 2,
            batch_size: 10_000,
            download_retries: 3,
            retry_base_delay_ms: 500,
            max_row_error_rate: 0.01,
            min_rows_for_error_rate: 1_000,
            log_malformed_rows: 5,
            max_failed_fraction: 0.5,
            history_start: None,
            backfill_days: 30,
        }
    }
}

impl PipelineSettings {
    pub fn history_start_for(&self, today: NaiveDate) -> NaiveDate {
        self.history_start
            .unwrap_or_else(|| today - chrono::Duration::days(2 * 365))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifySettings {
    /// Tickers sampled by `update`.
    pub update_sample_size: usize,
    /// Tickers sampled by `verify`.
    pub sample_size: usize,
    /// Relative tolerance, 0.001 = 0.1%.
    pub tolerance: f64,
    /// Only splits executed within this many days are eligible.
    pub lookback_days: i64,
    pub reference_concurrency: usize,
    pub seed: Option<u64>,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            update_sample_size: 5,
            sample_size: 10,
            tolerance: 0.001,
            lookback_days: 365,
            reference_concurrency: 4,
            seed: None,
        }
    }
}

/// What a command needs from the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Requirements {
    pub rest_api: bool,
    pub flat_files: bool,
}

impl Requirements {
    pub const NONE: Requirements = Requirements {
        rest_api: false,
        flat_files: false,
    };
    pub const ALL: Requirements = Requirements {
        rest_api: true,
        flat_files: true,
    };
}

impl Settings {
    /// Load from file (explicit or default) and apply the environment overlay.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overlay environment variables. `lookup` is injected so tests do not
    /// touch the process environment.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("POLYGON_API_KEY") {
            self.vendor.api_key = v;
        }
        if let Some(v) = get("POLYGON_FLATFILES_ACCESS_KEY") {
            self.flatfiles.access_key = v;
        }
        if let Some(v) = get("POLYGON_FLATFILES_SECRET_KEY") {
            self.flatfiles.secret_key = v;
        }
        if let Some(v) = get("POLYGON_FLATFILES_ENDPOINT") {
            self.flatfiles.endpoint = v;
        }
        if let Some(v) = get("OPTIONALITY_STORAGE_PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Some(v) = get("OPTIONALITY_FLATFILES_SOURCE") {
            self.flatfiles.source = match v.trim().to_ascii_lowercase().as_str() {
                "s3" => FlatFileSourceKind::S3,
                "local" => FlatFileSourceKind::Local,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "OPTIONALITY_FLATFILES_SOURCE".into(),
                        reason: format!("'{other}' is not s3 or local"),
                    })
                }
            };
        }
        if let Some(v) = get("OPTIONALITY_FLATFILES_PATH") {
            self.flatfiles.local_path = PathBuf::from(v);
        }
        Ok(())
    }

    /// Reject settings that would make a run meaningless or unsafe.
    pub fn validate(&self, needs: Requirements) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let p = &self.pipeline;
        if p.download_concurrency == 0 {
            return Err(invalid("pipeline.download_concurrency", "must be at least 1"));
        }
        if p.processing_concurrency == 0 {
            return Err(invalid("pipeline.processing_concurrency", "must be at least 1"));
        }
        if p.batch_size == 0 {
            return Err(invalid("pipeline.batch_size", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&p.max_row_error_rate) {
            return Err(invalid("pipeline.max_row_error_rate", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&p.max_failed_fraction) {
            return Err(invalid("pipeline.max_failed_fraction", "must be within [0, 1]"));
        }
        if p.backfill_days < 0 {
            return Err(invalid("pipeline.backfill_days", "must not be negative"));
        }

        let v = &self.verify;
        if !(v.tolerance.is_finite() && v.tolerance >= 0.0) {
            return Err(invalid("verify.tolerance", "must be a non-negative number"));
        }
        if v.reference_concurrency == 0 {
            return Err(invalid("verify.reference_concurrency", "must be at least 1"));
        }
        if v.lookback_days <= 0 {
            return Err(invalid("verify.lookback_days", "must be positive"));
        }

        if needs.rest_api && self.vendor.api_key.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "vendor.api_key",
                env: "POLYGON_API_KEY",
                section: "vendor",
            });
        }
        if needs.flat_files && self.flatfiles.source == FlatFileSourceKind::S3 {
            if self.flatfiles.access_key.trim().is_empty() {
                return Err(ConfigError::Missing {
                    key: "flatfiles.access_key",
                    env: "POLYGON_FLATFILES_ACCESS_KEY",
                    section: "flatfiles",
                });
            }
            if self.flatfiles.secret_key.trim().is_empty() {
                return Err(ConfigError::Missing {
                    key: "flatfiles.secret_key",
                    env: "POLYGON_FLATFILES_SECRET_KEY",
                    section: "flatfiles",
                });
            }
        }
        Ok(())
    }
}
