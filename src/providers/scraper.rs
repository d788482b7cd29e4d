use crate::core::config::SourceConfig;
use crate::core::price::DEFAULT_CURRENCY;
use crate::core::{FetchParams, PriceSource, Quote, SourceError, SourceErrorKind};
use crate::providers::util::with_retry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Client for the scraper backend that drives the actual price lookups.
pub struct ScraperSource {
    base_url: String,
    client: reqwest::Client,
    retries: usize,
    retry_delay_ms: u64,
    closed: AtomicBool,
}

impl ScraperSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("pricegate/0.1")
            .timeout(timeout)
            .build()
            .context("Failed to build scraper HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retries: 0,
            retry_delay_ms: 0,
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(Self::new(&config.base_url, config.timeout())?
            .with_retries(config.retries, config.retry_delay_ms))
    }

    pub fn with_retries(mut self, retries: usize, delay_ms: u64) -> Self {
        self.retries = retries;
        self.retry_delay_ms = delay_ms;
        self
    }

    fn price_url(&self, params: &FetchParams) -> Result<Url, SourceError> {
        Url::parse_with_params(&format!("{}/price", self.base_url), params.iter()).map_err(|e| {
            SourceError::new(
                SourceErrorKind::NavigationFailed,
                format!("Invalid scraper URL {}: {}", self.base_url, e),
            )
        })
    }
}

#[derive(Debug, Deserialize)]
struct ScraperQuote {
    price: Value,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    tax_inclusive: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ScraperFailure {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Numbers pass through, numeric strings are parsed and anything else
/// becomes zero.
fn coerce_price(value: &Value) -> f64 {
    let coerced = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    coerced.unwrap_or_else(|| {
        warn!(price = %value, "Non-numeric price from scraper, using 0");
        0.0
    })
}

fn classify(err: &reqwest::Error) -> SourceErrorKind {
    if err.is_timeout() {
        SourceErrorKind::Timeout
    } else if err.is_connect() || err.is_redirect() {
        SourceErrorKind::NavigationFailed
    } else if err.is_decode() {
        SourceErrorKind::ParseFailed
    } else {
        SourceErrorKind::Unknown
    }
}

fn from_reqwest(err: reqwest::Error) -> SourceError {
    SourceError::new(classify(&err), err.to_string())
}

#[async_trait]
impl PriceSource for ScraperSource {
    #[instrument(name = "ScraperFetch", skip(self, params), fields(params = %params.canonical()))]
    async fn fetch_price(&self, params: &FetchParams) -> Result<Quote, SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::new(
                SourceErrorKind::Unknown,
                "Price source is closed",
            ));
        }

        let url = self.price_url(params)?;
        debug!("Requesting price from {}", url);

        let response = with_retry(
            || self.client.get(url.clone()).send(),
            self.retries,
            self.retry_delay_ms,
        )
        .await
        .map_err(from_reqwest)?;

        let status = response.status();
        let body = response.bytes().await.map_err(from_reqwest)?;

        if !status.is_success() {
            let failure: Option<ScraperFailure> = serde_json::from_slice(&body).ok();
            let (kind, message) = match failure {
                Some(f) => (
                    f.kind
                        .as_deref()
                        .and_then(|k| k.parse().ok())
                        .unwrap_or(SourceErrorKind::Unknown),
                    f.message
                        .unwrap_or_else(|| format!("Scraper returned HTTP {status}")),
                ),
                None => (
                    SourceErrorKind::Unknown,
                    format!("Scraper returned HTTP {status}"),
                ),
            };
            debug!(%status, %kind, "Scraper reported failure");
            return Err(SourceError::new(kind, message));
        }

        let quote: ScraperQuote = serde_json::from_slice(&body).map_err(|e| {
            SourceError::new(
                SourceErrorKind::ParseFailed,
                format!("Failed to parse scraper response: {e}"),
            )
        })?;
        debug!(?quote, "Received scraper quote");

        Ok(Quote {
            price: coerce_price(&quote.price),
            currency: quote
                .currency
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            tax_inclusive: quote.tax_inclusive.unwrap_or(true),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let url = format!("{}/session", self.base_url);
        info!("Closing scraper session at {}", url);
        match self.client.delete(&url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Scraper session closed");
            }
            Ok(response) => warn!("Scraper session close returned HTTP {}", response.status()),
            Err(e) => warn!("Failed to close scraper session: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params() -> FetchParams {
        FetchParams::new()
            .with("venue", "harbour")
            .with("guests", "4")
    }

    // Helper function to create a mock scraper answering /price
    async fn create_scraper_mock(status_code: u16, body: &str) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/price"))
            .and(query_param("venue", "harbour"))
            .and(query_param("guests", "4"))
            .respond_with(ResponseTemplate::new(status_code).set_body_string(body))
            .mount(&mock_server)
            .await;
        mock_server
    }

    fn source_for(server: &MockServer) -> ScraperSource {
        ScraperSource::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_price_success() {
        let server = create_scraper_mock(
            200,
            r#"{"price": 149.5, "currency": "usd", "tax_inclusive": false}"#,
        )
        .await;

        let quote = source_for(&server).fetch_price(&params()).await.unwrap();
        assert_eq!(quote.price, 149.5);
        assert_eq!(quote.currency, "usd");
        assert!(!quote.tax_inclusive);
    }

    #[tokio::test]
    async fn test_fetch_price_defaults_and_string_price() {
        let server = create_scraper_mock(200, r#"{"price": "89.90"}"#).await;

        let quote = source_for(&server).fetch_price(&params()).await.unwrap();
        assert_eq!(quote.price, 89.9);
        assert_eq!(quote.currency, "EUR");
        assert!(quote.tax_inclusive);
    }

    #[tokio::test]
    async fn test_non_numeric_price_coerces_to_zero() {
        let server = create_scraper_mock(200, r#"{"price": "on request"}"#).await;

        let quote = source_for(&server).fetch_price(&params()).await.unwrap();
        assert_eq!(quote.price, 0.0);
    }

    #[tokio::test]
    async fn test_reported_failure_kind_is_passed_through() {
        let server = create_scraper_mock(
            502,
            r#"{"kind": "navigation_failed", "message": "page did not load"}"#,
        )
        .await;

        let err = source_for(&server).fetch_price(&params()).await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::NavigationFailed);
        assert_eq!(err.message, "page did not load");
    }

    #[tokio::test]
    async fn test_unstructured_failure_is_unknown() {
        let server = create_scraper_mock(500, "Internal Server Error").await;

        let err = source_for(&server).fetch_price(&params()).await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Unknown);
        assert!(err.message.contains("500"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_failure() {
        let server = create_scraper_mock(200, "<html>not json</html>").await;

        let err = source_for(&server).fetch_price(&params()).await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::ParseFailed);
    }

    #[tokio::test]
    async fn test_slow_scraper_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/price"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"price": 1}"#)
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let source = ScraperSource::new(&server.uri(), Duration::from_millis(50)).unwrap();
        let err = source.fetch_price(&params()).await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_unreachable_scraper_is_navigation_failure() {
        let source = ScraperSource::new("http://127.0.0.1:1", Duration::from_secs(1))
            .unwrap()
            .with_retries(1, 1);
        let err = source.fetch_price(&params()).await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::NavigationFailed);
    }

    #[tokio::test]
    async fn test_close_releases_session_once() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server);
        source.close().await.unwrap();
        source.close().await.unwrap();

        let err = source.fetch_price(&params()).await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_close_failure_is_not_fatal() {
        let source = ScraperSource::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        assert!(source.close().await.is_ok());
    }

    #[test]
    fn test_coerce_price() {
        assert_eq!(coerce_price(&serde_json::json!(12.5)), 12.5);
        assert_eq!(coerce_price(&serde_json::json!(" 7 ")), 7.0);
        assert_eq!(coerce_price(&serde_json::json!(null)), 0.0);
        assert_eq!(coerce_price(&serde_json::json!([1])), 0.0);
    }
}
