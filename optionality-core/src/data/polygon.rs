//! Polygon REST client for reference data and spot-check prices.
//!
//! Handles pagination (`next_url`), retries with exponential backoff, rate
//! limiting, and the circuit breaker. The daily flat files are served by a
//! separate S3 endpoint, see `flatfiles`.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{backoff_delay, VendorError};
use crate::domain::{SplitEvent, TickerMetadata};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

/// Hard cap on followed `next_url` links for a single listing.
const MAX_PAGES: usize = 10_000;

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SplitRecord {
    id: Option<String>,
    ticker: String,
    execution_date: NaiveDate,
    split_from: f64,
    split_to: f64,
}

#[derive(Debug, Deserialize)]
struct TickerRecord {
    ticker: String,
    name: Option<String>,
    market: Option<String>,
    locale: Option<String>,
    primary_exchange: Option<String>,
    #[serde(rename = "type")]
    ticker_type: Option<String>,
    #[serde(default)]
    active: bool,
    currency_name: Option<String>,
    cik: Option<String>,
    composite_figi: Option<String>,
    share_class_figi: Option<String>,
    last_updated_utc: Option<String>,
    delisted_utc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AggsResponse {
    results: Option<Vec<AggBar>>,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    c: f64,
}

/// Connection settings for the REST client.
#[derive(Debug, Clone)]
pub struct PolygonRestConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub page_limit: u32,
}

impl PolygonRestConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            page_limit: 1000,
        }
    }
}

/// Blocking Polygon REST client.
pub struct PolygonRest {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    config: PolygonRestConfig,
}

impl PolygonRest {
    pub fn new(
        config: PolygonRestConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, VendorError> {
        if config.api_key.trim().is_empty() {
            return Err(VendorError::Configuration("Polygon API key is empty".into()));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("optionality/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VendorError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            config,
        })
    }

    pub fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }

    fn splits_url(&self, since: NaiveDate) -> String {
        format!(
            "{}/v3/reference/splits?execution_date.gte={since}&order=asc&sort=execution_date&limit={}",
            self.config.base_url, self.config.page_limit
        )
    }

    fn tickers_url(&self) -> String {
        format!(
            "{}/v3/reference/tickers?market=stocks&active=true&order=asc&sort=ticker&limit={}",
            self.config.base_url, self.config.page_limit
        )
    }

    fn aggs_url(&self, ticker: &str, date: NaiveDate) -> String {
        format!(
            "{}/v2/aggs/ticker/{ticker}/range/1/day/{date}/{date}?adjusted=true&limit=1",
            self.config.base_url
        )
    }

    /// Every split executing on or after `since`. Records with a missing id
    /// or a non-integer ratio are logged and dropped.
    pub fn splits_since(&self, since: NaiveDate) -> Result<Vec<SplitEvent>, VendorError> {
        let records: Vec<SplitRecord> = self.paginate(self.splits_url(since))?;
        let mut splits = Vec::with_capacity(records.len());
        for record in records {
            let Some(id) = record.id.filter(|id| !id.is_empty()) else {
                warn!(ticker = %record.ticker, "dropping split without id");
                continue;
            };
            match SplitEvent::from_vendor_ratio(
                id,
                record.ticker,
                record.execution_date,
                record.split_from,
                record.split_to,
            ) {
                Ok(split) => splits.push(split),
                Err(e) => warn!("dropping invalid split: {e}"),
            }
        }
        Ok(splits)
    }

    pub fn tickers(&self) -> Result<Vec<TickerMetadata>, VendorError> {
        let records: Vec<TickerRecord> = self.paginate(self.tickers_url())?;
        Ok(records
            .into_iter()
            .map(|r| TickerMetadata {
                ticker: r.ticker,
                name: r.name,
                market: r.market,
                locale: r.locale,
                primary_exchange: r.primary_exchange,
                ticker_type: r.ticker_type,
                active: r.active,
                currency_name: r.currency_name,
                cik: r.cik,
                composite_figi: r.composite_figi,
                share_class_figi: r.share_class_figi,
                last_updated_utc: r.last_updated_utc,
                delisted_utc: r.delisted_utc,
            })
            .collect())
    }

    /// Split-adjusted daily close for one ticker and date.
    pub fn adjusted_close(&self, ticker: &str, date: NaiveDate) -> Result<Option<f64>, VendorError> {
        match self.get_json::<AggsResponse>(&self.aggs_url(ticker, date)) {
            Ok(resp) => Ok(resp
                .results
                .and_then(|bars| bars.into_iter().next())
                .map(|bar| bar.c)),
            Err(VendorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Follow `next_url` links until the listing is exhausted.
    fn paginate<T: DeserializeOwned>(&self, first_url: String) -> Result<Vec<T>, VendorError> {
        let mut all = Vec::new();
        let mut next = Some(first_url);
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(VendorError::ResponseFormatChanged(format!(
                    "pagination did not terminate after {MAX_PAGES} pages"
                )));
            }
            let page: Page<T> = self.get_json(&url)?;
            debug!(page = pages, rows = page.results.len(), "fetched page");
            all.extend(page.results);
            next = page.next_url.filter(|n| *n != url);
        }

        Ok(all)
    }

    /// Execute a GET with retry and circuit breaker logic.
    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, VendorError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(VendorError::CircuitBreakerTripped);
        }

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = match &last_error {
                    Some(VendorError::RateLimited { retry_after_secs }) => {
                        Duration::from_secs(*retry_after_secs)
                    }
                    _ => backoff_delay(self.config.base_delay, attempt - 1),
                };
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(VendorError::CircuitBreakerTripped);
            }

            match self.client.get(url).bearer_auth(&self.config.api_key).send() {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::FORBIDDEN {
                        self.circuit_breaker.trip();
                        return Err(VendorError::AuthenticationRequired(format!(
                            "HTTP 403 for {}",
                            redact(url)
                        )));
                    }

                    if status == reqwest::StatusCode::UNAUTHORIZED {
                        return Err(VendorError::AuthenticationRequired(
                            "Polygon rejected the API key".into(),
                        ));
                    }

                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(VendorError::NotFound(redact(url)));
                    }

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        self.circuit_breaker.record_failure();
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(60);
                        warn!(retry_after, "rate limited by Polygon");
                        last_error = Some(VendorError::RateLimited {
                            retry_after_secs: retry_after,
                        });
                        continue;
                    }

                    if status.is_server_error() {
                        self.circuit_breaker.record_failure();
                        last_error = Some(VendorError::Server {
                            status: status.as_u16(),
                            context: redact(url),
                        });
                        continue;
                    }

                    if !status.is_success() {
                        return Err(VendorError::Other(format!(
                            "HTTP {status} for {}",
                            redact(url)
                        )));
                    }

                    let body: T = resp.json().map_err(|e| {
                        VendorError::ResponseFormatChanged(format!(
                            "failed to parse response for {}: {e}",
                            redact(url)
                        ))
                    })?;
                    self.circuit_breaker.record_success();
                    return Ok(body);
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        last_error = Some(VendorError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(VendorError::NetworkUnreachable(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| VendorError::Other("max retries exceeded".into())))
    }
}

/// Strip the query string so cursors and keys never reach the logs.
fn redact(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PolygonRest {
        PolygonRest::new(
            PolygonRestConfig::new("test-key"),
            Arc::new(CircuitBreaker::default_vendor()),
        )
        .unwrap()
    }

    #[test]
    fn empty_api_key_rejected() {
        let result = PolygonRest::new(
            PolygonRestConfig::new("  "),
            Arc::new(CircuitBreaker::default_vendor()),
        );
        assert!(matches!(result, Err(VendorError::Configuration(_))));
    }

    #[test]
    fn aggs_url_requests_adjusted_single_day() {
        let url = client().aggs_url("AAPL", NaiveDate::from_ymd_opt(2020, 8, 28).unwrap());
        assert_eq!(
            url,
            "https://api.polygon.io/v2/aggs/ticker/AAPL/range/1/day/2020-08-28/2020-08-28?adjusted=true&limit=1"
        );
    }

    #[test]
    fn splits_url_filters_by_execution_date() {
        let url = client().splits_url(NaiveDate::from_ymd_opt(2022, 1, 3).unwrap());
        assert!(url.contains("/v3/reference/splits?"));
        assert!(url.contains("execution_date.gte=2022-01-03"));
    }

    #[test]
    fn redact_drops_query() {
        assert_eq!(
            redact("https://api.polygon.io/v3/reference/splits?cursor=abc"),
            "https://api.polygon.io/v3/reference/splits"
        );
    }

    #[test]
    fn tripped_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::default_vendor());
        breaker.trip();
        let rest = PolygonRest::new(PolygonRestConfig::new("k"), breaker).unwrap();
        let result = rest.adjusted_close("AAPL", NaiveDate::from_ymd_opt(2020, 8, 28).unwrap());
        assert!(matches!(result, Err(VendorError::CircuitBreakerTripped)));
    }

    #[test]
    fn page_parses_without_next_url() {
        let json = r#"{"results":[{"id":"E1","ticker":"AAPL","execution_date":"2020-08-31","split_from":1,"split_to":4}],"status":"OK"}"#;
        let page: Page<SplitRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(page.results.len(), 1);
        assert!(page.next_url.is_none());
        assert_eq!(page.results[0].split_to, 4.0);
    }

    #[test]
    fn ticker_record_reads_type_field() {
        let json = r#"{"ticker":"BRK.A","name":"Berkshire","market":"stocks","type":"CS","active":true}"#;
        let record: TickerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.ticker_type.as_deref(), Some("CS"));
        assert!(record.active);
        assert!(record.cik.is_none());
    }
}
