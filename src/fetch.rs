//! Cached price lookups against an external price source.

use crate::core::price::CACHE_SOURCE;
use crate::core::{
    FetchParams, KeyValueCollection, PriceRecord, PriceResult, PriceSource, Quote, SourceError,
    SourceErrorKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Provenance tag for quotes fetched straight from the source.
pub const LIVE_SOURCE: &str = "live";

/// Turns calls to a [`PriceSource`] into [`PriceResult`] values, caching
/// successful quotes.
///
/// Collaborator failures never escape as errors; they come back as
/// `PriceResult::Error` and are not cached. Rate limiting is the caller's
/// responsibility.
pub struct FetchService {
    source: Arc<dyn PriceSource>,
    cache: Arc<dyn KeyValueCollection>,
    ttl: Duration,
    timeout: Option<Duration>,
}

impl FetchService {
    pub fn new(
        source: Arc<dyn PriceSource>,
        cache: Arc<dyn KeyValueCollection>,
        ttl: Duration,
    ) -> Self {
        Self {
            source,
            cache,
            ttl,
            timeout: None,
        }
    }

    /// Fails source calls that take longer than `timeout` with a `timeout` error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn source(&self) -> &Arc<dyn PriceSource> {
        &self.source
    }

    pub fn cache(&self) -> &Arc<dyn KeyValueCollection> {
        &self.cache
    }

    async fn call_source(&self, params: &FetchParams) -> Result<Quote, SourceError> {
        let Some(limit) = self.timeout else {
            return self.source.fetch_price(params).await;
        };
        tokio::time::timeout(limit, self.source.fetch_price(params))
            .await
            .unwrap_or_else(|_| {
                Err(SourceError::new(
                    SourceErrorKind::Timeout,
                    format!("Price source did not answer within {limit:?}"),
                ))
            })
    }

    #[instrument(name = "PriceFetch", skip(self, params), fields(key = tracing::field::Empty))]
    pub async fn fetch(&self, params: &FetchParams) -> PriceResult {
        let key = params.cache_key();
        tracing::Span::current().record("key", key.as_str());

        if let Some(cached) = self.lookup(&key).await {
            debug!("Serving cached price");
            return cached.with_source(CACHE_SOURCE);
        }

        // No cache lock is held while the source works.
        match self.call_source(params).await {
            Ok(quote) => {
                let result = PriceResult::success(
                    quote.price,
                    &quote.currency,
                    LIVE_SOURCE,
                    quote.tax_inclusive,
                );
                self.store(&key, &result).await;
                info!(
                    total_price = %result.total_price(),
                    currency = result.currency(),
                    "Fetched live price"
                );
                result
            }
            Err(e) => {
                warn!(code = e.kind.code(), message = %e.message, "Price source failed");
                PriceResult::error(e.kind.code(), &e.message)
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<PriceResult> {
        let bytes = self.cache.get(key.as_bytes()).await?;
        match serde_json::from_slice::<PriceRecord>(&bytes) {
            Ok(record) => Some(PriceResult::from_record(&record)),
            Err(e) => {
                debug!("Ignoring unreadable cache entry {}: {}", key, e);
                None
            }
        }
    }

    async fn store(&self, key: &str, result: &PriceResult) {
        match serde_json::to_vec(&result.to_record()) {
            Ok(bytes) => self.cache.put(key.as_bytes(), &bytes, Some(self.ttl)).await,
            Err(e) => warn!("Failed to serialize price for cache: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCollection;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockSource {
        call_count: AtomicUsize,
        outcome: Result<Quote, SourceError>,
    }

    impl MockSource {
        fn ok(price: f64) -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                outcome: Ok(Quote {
                    price,
                    currency: "eur".to_string(),
                    tax_inclusive: true,
                }),
            }
        }

        fn failing(kind: SourceErrorKind) -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                outcome: Err(SourceError::new(kind, "scraper gave up")),
            }
        }

        fn calls(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceSource for MockSource {
        async fn fetch_price(&self, _params: &FetchParams) -> Result<Quote, SourceError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn params() -> FetchParams {
        FetchParams::new().with("venue", "harbour").with("date", "2026-10-19")
    }

    fn service(source: Arc<MockSource>, cache: Arc<MemoryCollection>) -> FetchService {
        FetchService::new(source, cache, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let source = Arc::new(MockSource::ok(42.125));
        let cache = Arc::new(MemoryCollection::new());
        let service = service(Arc::clone(&source), Arc::clone(&cache));

        let first = service.fetch(&params()).await;
        assert!(first.is_success());
        assert_eq!(first.source(), Some("live"));
        assert_eq!(first.currency(), "EUR");
        assert_eq!(first.total_price(), Decimal::new(4213, 2));
        assert_eq!(source.calls(), 1);

        let second = service.fetch(&params()).await;
        assert_eq!(second.source(), Some("cache"));
        assert_eq!(second.total_price(), first.total_price());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_prepopulated_cache_skips_source() {
        let source = Arc::new(MockSource::ok(1.0));
        let cache = Arc::new(MemoryCollection::new());
        let record = PriceResult::success(19.99, "GBP", "live", false).to_record();
        cache
            .put(
                params().cache_key().as_bytes(),
                &serde_json::to_vec(&record).unwrap(),
                None,
            )
            .await;

        let result = service(Arc::clone(&source), cache).fetch(&params()).await;
        assert_eq!(source.calls(), 0);
        assert_eq!(result.currency(), "GBP");
        assert_eq!(result.source(), Some("cache"));
        assert!(!result.is_tax_inclusive());
    }

    #[tokio::test]
    async fn test_failures_are_returned_and_not_cached() {
        let source = Arc::new(MockSource::failing(SourceErrorKind::Timeout));
        let cache = Arc::new(MemoryCollection::new());
        let service = service(Arc::clone(&source), Arc::clone(&cache));

        let result = service.fetch(&params()).await;
        assert!(result.is_error());
        assert_eq!(result.error_code(), Some("timeout"));
        assert_eq!(result.error_message(), Some("scraper gave up"));
        assert_eq!(cache.len().await, 0);

        service.fetch(&params()).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_error_codes_pass_through() {
        for (kind, code) in [
            (SourceErrorKind::NavigationFailed, "navigation_failed"),
            (SourceErrorKind::ParseFailed, "parse_failed"),
            (SourceErrorKind::Unknown, "unknown"),
        ] {
            let source = Arc::new(MockSource::failing(kind));
            let result = service(source, Arc::new(MemoryCollection::new()))
                .fetch(&params())
                .await;
            assert_eq!(result.error_code(), Some(code));
        }
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_falls_back_to_source() {
        let source = Arc::new(MockSource::ok(5.0));
        let cache = Arc::new(MemoryCollection::new());
        cache
            .put(params().cache_key().as_bytes(), b"garbage", None)
            .await;

        let result = service(Arc::clone(&source), Arc::clone(&cache))
            .fetch(&params())
            .await;
        assert_eq!(result.source(), Some("live"));
        assert_eq!(source.calls(), 1);
    }

    struct StalledSource {
        call_count: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for StalledSource {
        async fn fetch_price(&self, _params: &FetchParams) -> Result<Quote, SourceError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_source_times_out() {
        let source = Arc::new(StalledSource {
            call_count: AtomicUsize::new(0),
        });
        let cache = Arc::new(MemoryCollection::new());
        let service = FetchService::new(
            Arc::clone(&source) as Arc<dyn PriceSource>,
            Arc::clone(&cache) as Arc<dyn KeyValueCollection>,
            Duration::from_secs(60),
        )
        .with_timeout(Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        let result = service.fetch(&params()).await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(result.error_code(), Some("timeout"));
        assert_eq!(cache.len().await, 0);

        service.fetch(&params()).await;
        assert_eq!(source.call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_does_not_affect_fast_sources() {
        let source = Arc::new(MockSource::ok(7.5));
        let service = FetchService::new(
            Arc::clone(&source) as Arc<dyn PriceSource>,
            Arc::new(MemoryCollection::new()),
            Duration::from_secs(60),
        )
        .with_timeout(Duration::from_secs(5));

        let result = service.fetch(&params()).await;
        assert!(result.is_success());
        assert_eq!(source.calls(), 1);
    }
}
