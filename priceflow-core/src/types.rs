//! Data model shared by every engine component.
//!
//! Mirrors §3 of the specification this crate implements: pairs, quotes,
//! cache metadata, pair registrations, and retry metadata.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Closed-ish enumeration of known upstream providers.
///
/// `Other` keeps the registry from panicking if an adapter is registered
/// under a name this crate doesn't yet know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SourceName {
    /// Binance spot REST/WS API.
    Binance,
    /// OKX spot REST/WS API.
    Okx,
    /// Coinbase Exchange REST/WS API.
    Coinbase,
    /// Kraken REST/WS API.
    Kraken,
    /// `CryptoCompare` aggregated REST API.
    Cryptocompare,
    /// `CoinGecko` REST API.
    Coingecko,
    /// Finnhub REST API.
    Finnhub,
    /// Alpha Vantage REST API.
    Alphavantage,
    /// `exchangerate.host` REST API.
    Exchangeratehost,
    /// Frankfurter (ECB) REST API.
    Frankfurter,
    /// Any source not in the closed set above, identified by a free-form name.
    Other(String),
}

impl SourceName {
    /// Stable, lowercase identifier used in logs, metrics labels, and cache keys.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Binance => "binance",
            Self::Okx => "okx",
            Self::Coinbase => "coinbase",
            Self::Kraken => "kraken",
            Self::Cryptocompare => "cryptocompare",
            Self::Coingecko => "coingecko",
            Self::Finnhub => "finnhub",
            Self::Alphavantage => "alphavantage",
            Self::Exchangeratehost => "exchangeratehost",
            Self::Frankfurter => "frankfurter",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered `(base, quote)` asset pair.
///
/// Case is preserved as registered but equality/hashing is case-insensitive,
/// matching the spec's "case preserved as registered, compared
/// case-insensitively where adapters normalize" rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
    base: String,
    quote: String,
}

impl Pair {
    /// Construct a pair from non-empty base/quote symbols.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidArg` if either symbol is empty.
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Result<Self, EngineError> {
        let base = base.into();
        let quote = quote.into();
        if base.trim().is_empty() || quote.trim().is_empty() {
            return Err(EngineError::InvalidArg(
                "pair base/quote must be non-empty".to_string(),
            ));
        }
        Ok(Self { base, quote })
    }

    /// The base symbol, in its originally-registered case.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The quote symbol, in its originally-registered case.
    #[must_use]
    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Cache-key-style rendering: `BASE/QUOTE` (case preserved).
    #[must_use]
    pub fn pair_key(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }

    fn fold_key(&self) -> (String, String) {
        (self.base.to_lowercase(), self.quote.to_lowercase())
    }
}

impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        self.fold_key() == other.fold_key()
    }
}
impl Eq for Pair {}

impl std::hash::Hash for Pair {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fold_key().hash(state);
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// A decimal price carried as a string to preserve provider precision.
///
/// Invariant: matches `^-?[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?$` after trim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Price(String);

impl Price {
    /// Parse and validate a price string.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidArg` if the trimmed string does not look
    /// like a decimal number (optionally signed, optionally exponential).
    pub fn parse(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if !is_decimal_literal(trimmed) {
            return Err(EngineError::InvalidArg(format!(
                "price {raw:?} is not a valid decimal literal"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The validated, trimmed price string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Price {
    type Error = EngineError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Price> for String {
    fn from(value: Price) -> Self {
        value.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_decimal_literal(s: &str) -> bool {
    let mut chars = s.chars().peekable();
    if chars.peek() == Some(&'-') {
        chars.next();
    }
    let mut saw_digit = false;
    for c in chars.by_ref() {
        if c.is_ascii_digit() {
            saw_digit = true;
        } else {
            break;
        }
    }
    if !saw_digit {
        return false;
    }
    // Re-scan properly with a small state machine instead of partial consumption above.
    decimal_state_machine(s)
}

fn decimal_state_machine(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    if i < bytes.len() && bytes[i] == b'-' {
        i += 1;
    }
    let int_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == int_start {
        return false;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let frac_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == frac_start {
            return false;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
    }
    i == bytes.len()
}

/// A point-in-time price for a pair, as reported by a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    /// The pair this quote is for.
    pub pair: Pair,
    /// The price, carried as a validated decimal string.
    pub price: Price,
    /// When the provider reported this price.
    pub received_at: SystemTime,
}

/// A quote enriched with cache provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQuote {
    /// The underlying quote.
    pub quote: Quote,
    /// The source that produced it.
    pub source: SourceName,
    /// When it was written into the cache. `cached_at >= received_at - eps`.
    pub cached_at: SystemTime,
}

/// Response shape returned by the quotes service front door (§4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    /// The source that served this quote.
    pub source: SourceName,
    /// The pair requested.
    pub pair: Pair,
    /// The price.
    pub price: Price,
    /// When the underlying provider reported the price.
    pub received_at: SystemTime,
}

/// Per-cache-entry bookkeeping (§3: `CacheMetadata`).
///
/// Invariant: `expires_at = cached_at + ttl`; `stale_trigger_before_expiry < ttl`.
#[derive(Debug, Clone)]
pub struct CacheMetadata {
    /// Source that owns this entry.
    pub source: SourceName,
    /// Pair this entry caches.
    pub pair: Pair,
    /// When the value was cached.
    pub cached_at: SystemTime,
    /// When the value expires.
    pub expires_at: SystemTime,
    /// The TTL used to compute `expires_at`.
    pub ttl: Duration,
    /// How long before `expires_at` the stale timer fires.
    pub stale_trigger_before_expiry: Duration,
    /// The last time a refresh (proactive or reactive) updated this entry.
    pub last_refreshed_at: SystemTime,
}

/// A single pending stale item, queued for batched emission (§4.F).
#[derive(Debug, Clone)]
pub struct StaleItem {
    /// Source the stale entry belongs to.
    pub source: SourceName,
    /// Pair the stale entry is for.
    pub pair: Pair,
    /// The cache entry's expiry time at the moment the stale timer fired.
    pub expires_at: SystemTime,
}

/// A debounced batch of stale items, emitted at most once per `batch_interval`.
#[derive(Debug, Clone)]
pub struct StaleBatch {
    /// The accrued stale items.
    pub items: Vec<StaleItem>,
    /// When this batch was emitted.
    pub batch_timestamp: SystemTime,
}

/// A tracked `(pair, source)` registration (§3: `PairRegistration`).
///
/// Invariant: `registered_at <= last_request_at`; `last_fetch_at` and
/// `last_response_at` default to `UNIX_EPOCH` until the first success.
#[derive(Debug, Clone)]
pub struct PairRegistration {
    /// The registered pair.
    pub pair: Pair,
    /// The source it's registered against.
    pub source: SourceName,
    /// When this `(pair, source)` was first requested.
    pub registered_at: SystemTime,
    /// When the last successful upstream fetch completed.
    pub last_fetch_at: SystemTime,
    /// When the last upstream response (success or failure) was observed.
    pub last_response_at: SystemTime,
    /// When the last client request for this pair/source arrived.
    pub last_request_at: SystemTime,
}

/// Retry bookkeeping for a pair that failed during a refresh cycle (§4.K).
///
/// Invariant: `1 <= attempt <= max_attempts`; `next_retry_at = last_attempt_at + retry_delay`.
#[derive(Debug, Clone)]
pub struct RetryMetadata {
    /// Source the failing pair belongs to.
    pub source: SourceName,
    /// The pair that failed to refresh.
    pub pair: Pair,
    /// How many attempts have been made so far.
    pub attempt: u32,
    /// When the pair first failed.
    pub first_failed_at: SystemTime,
    /// When the most recent attempt was made.
    pub last_attempt_at: SystemTime,
    /// When the next retry is due.
    pub next_retry_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_accepts_plain_and_exponential_decimals() {
        assert!(Price::parse("67890.12").is_ok());
        assert!(Price::parse("-1.5e-3").is_ok());
        assert!(Price::parse(" 42 ").is_ok());
        assert!(Price::parse("abc").is_err());
        assert!(Price::parse("1.").is_err());
        assert!(Price::parse(".5").is_err());
    }

    #[test]
    fn pair_equality_is_case_insensitive() {
        let a = Pair::new("BTC", "USDT").unwrap();
        let b = Pair::new("btc", "usdt").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.base(), "BTC");
    }

    #[test]
    fn pair_rejects_empty_symbols() {
        assert!(Pair::new("", "USDT").is_err());
    }
}
