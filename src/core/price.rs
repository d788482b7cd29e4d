//! Pricing abstractions and core types

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

pub const DEFAULT_CURRENCY: &str = "EUR";
pub const DEFAULT_SOURCE: &str = "easyrest";
pub const CACHE_SOURCE: &str = "cache";
pub const UNKNOWN_ERROR_CODE: &str = "unknown";
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Rounds to two decimal places, half away from zero. Values that are not
/// representable (NaN, infinities, out of range) collapse to zero.
fn round_price(price: f64) -> Decimal {
    if !price.is_finite() {
        return Decimal::ZERO;
    }
    // `Display` for f64 gives the shortest round-tripping form, so 12.345
    // parses as exactly 12.345 rather than its binary approximation.
    Decimal::from_str(&price.to_string())
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
        .unwrap_or(Decimal::ZERO)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    total_price: Decimal,
    currency: String,
    source: String,
    tax_inclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceFailure {
    code: String,
    message: String,
}

/// Outcome of a price fetch: either a quote or a typed error.
///
/// Values are immutable once built and can only be created through
/// [`PriceResult::success`] and [`PriceResult::error`] (or rebuilt from a
/// [`PriceRecord`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceResult {
    Success(PriceQuote),
    Error(PriceFailure),
}

impl PriceResult {
    pub fn success(price: f64, currency: &str, source: &str, tax_inclusive: bool) -> Self {
        PriceResult::Success(PriceQuote {
            total_price: round_price(price),
            currency: currency.trim().to_uppercase(),
            source: source.to_string(),
            tax_inclusive,
        })
    }

    /// Success with the default currency, source and tax treatment.
    pub fn success_with_defaults(price: f64) -> Self {
        Self::success(price, DEFAULT_CURRENCY, DEFAULT_SOURCE, true)
    }

    pub fn error(code: &str, message: &str) -> Self {
        PriceResult::Error(PriceFailure {
            code: code.to_string(),
            message: message.to_string(),
        })
    }

    /// Returns a copy tagged with a different provenance. Errors carry no
    /// source and are returned unchanged.
    pub fn with_source(&self, source: &str) -> Self {
        match self {
            PriceResult::Success(quote) => PriceResult::Success(PriceQuote {
                source: source.to_string(),
                ..quote.clone()
            }),
            PriceResult::Error(_) => self.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PriceResult::Success(_))
    }

    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    pub fn total_price(&self) -> Decimal {
        match self {
            PriceResult::Success(quote) => quote.total_price,
            PriceResult::Error(_) => Decimal::ZERO,
        }
    }

    pub fn currency(&self) -> &str {
        match self {
            PriceResult::Success(quote) => &quote.currency,
            PriceResult::Error(_) => DEFAULT_CURRENCY,
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            PriceResult::Success(quote) => Some(&quote.source),
            PriceResult::Error(_) => None,
        }
    }

    pub fn is_tax_inclusive(&self) -> bool {
        match self {
            PriceResult::Success(quote) => quote.tax_inclusive,
            PriceResult::Error(_) => false,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            PriceResult::Success(_) => None,
            PriceResult::Error(failure) => Some(&failure.code),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            PriceResult::Success(_) => None,
            PriceResult::Error(failure) => Some(&failure.message),
        }
    }

    pub fn to_record(&self) -> PriceRecord {
        PriceRecord {
            success: self.is_success(),
            total_price: self.total_price().to_f64(),
            currency: Some(self.currency().to_string()),
            source: self.source().map(str::to_string),
            tax_inclusive: Some(self.is_tax_inclusive()),
            error_code: self.error_code().map(str::to_string),
            error_message: self.error_message().map(str::to_string),
        }
    }

    /// Rebuilds a result from a record, filling in defaults for fields that
    /// older or partial records may lack.
    pub fn from_record(record: &PriceRecord) -> Self {
        if record.success {
            Self::success(
                record.total_price.unwrap_or_default(),
                record.currency.as_deref().unwrap_or(DEFAULT_CURRENCY),
                record.source.as_deref().unwrap_or(CACHE_SOURCE),
                record.tax_inclusive.unwrap_or(true),
            )
        } else {
            Self::error(
                record.error_code.as_deref().unwrap_or(UNKNOWN_ERROR_CODE),
                record
                    .error_message
                    .as_deref()
                    .unwrap_or(UNKNOWN_ERROR_MESSAGE),
            )
        }
    }
}

/// Flat key-value form of a [`PriceResult`], used for the cache and the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tax_inclusive: Option<bool>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Query parameters for a price lookup, kept sorted so that equal queries
/// produce equal cache keys regardless of argument order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchParams(BTreeMap<String, String>);

impl FetchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        let key = key.trim().to_lowercase();
        if !key.is_empty() {
            self.0.insert(key, value.trim().to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Canonical `k=v&k=v` form over the normalized, sorted pairs.
    pub fn canonical(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Stable cache key: FNV-1a over the canonical form.
    pub fn cache_key(&self) -> String {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let hash = self
            .canonical()
            .bytes()
            .fold(OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(PRIME));
        format!("price:{hash:016x}")
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for FetchParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = FetchParams::new();
        for (k, v) in iter {
            params.insert(k.as_ref(), v.as_ref());
        }
        params
    }
}

impl FromStr for FetchParams {
    type Err = anyhow::Error;

    /// Parses a single `key=value` pair as given on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, got: {}", s))?;
        if key.trim().is_empty() {
            anyhow::bail!("Empty parameter name in: {}", s);
        }
        Ok(FetchParams::new().with(key, value))
    }
}

/// Raw quote as reported by a price source, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub price: f64,
    pub currency: String,
    pub tax_inclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceErrorKind {
    Timeout,
    NavigationFailed,
    ParseFailed,
    Unknown,
}

impl SourceErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            SourceErrorKind::Timeout => "timeout",
            SourceErrorKind::NavigationFailed => "navigation_failed",
            SourceErrorKind::ParseFailed => "parse_failed",
            SourceErrorKind::Unknown => "unknown",
        }
    }
}

impl Display for SourceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for SourceErrorKind {
    type Err = std::convert::Infallible;

    /// Unrecognised codes map to `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "timeout" => SourceErrorKind::Timeout,
            "navigation_failed" => SourceErrorKind::NavigationFailed,
            "parse_failed" => SourceErrorKind::ParseFailed,
            _ => SourceErrorKind::Unknown,
        })
    }
}

/// Failure reported by an external price source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SourceError {}

/// The external system that actually knows prices (a scraper or a browser
/// automation backend).
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_price(&self, params: &FetchParams) -> Result<Quote, SourceError>;

    /// Releases any resources held by the source. Called once during shutdown.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
