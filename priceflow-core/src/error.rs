//! The stable error taxonomy shared by every engine component.

use serde::{Deserialize, Serialize};

use crate::types::SourceName;

/// Errors produced anywhere in the pricing engine.
///
/// Every variant is `Clone` and serializable so it can be attached to cache
/// entries, retry metadata, and metrics labels without cloning strings by
/// hand at every call site.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EngineError {
    /// No cached or upstream price is available for `pair` at `source`.
    #[error("no price available for {pair} at {source}")]
    PriceNotFound {
        /// The requested pair, rendered as `BASE/QUOTE`.
        pair: String,
        /// The source that was asked.
        source: SourceName,
    },

    /// The configured credentials were rejected by the upstream source.
    #[error("unauthorized against source {source}")]
    Unauthorized {
        /// The source that rejected the request.
        source: SourceName,
    },

    /// The upstream source's rate limit was hit.
    #[error("rate limited by source {source}")]
    RateLimited {
        /// The source that throttled the request.
        source: SourceName,
    },

    /// A batch request asked for more pairs than the adapter supports.
    #[error("batch of {requested} pairs exceeds {source}'s max of {max}")]
    BatchSizeExceeded {
        /// Number of pairs requested.
        requested: usize,
        /// The adapter's maximum batch size.
        max: usize,
        /// The source the batch was sent to.
        source: SourceName,
    },

    /// The upstream API returned an error response.
    #[error("source {source} returned an API error{}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    SourceApi {
        /// The source that errored.
        source: SourceName,
        /// The upstream HTTP status code, if one was available.
        status: Option<u16>,
    },

    /// A request to `source` for `pair` did not complete within `ttl_ms`.
    #[error("request to {source} for {pair} timed out after {ttl_ms}ms")]
    Timeout {
        /// The source that timed out.
        source: SourceName,
        /// The pair being requested.
        pair: String,
        /// The timeout that was exceeded, in milliseconds.
        ttl_ms: u64,
    },

    /// A source name was referenced that has no registered adapter.
    #[error("source {name} is not registered")]
    SourceUnsupported {
        /// The unregistered source name.
        name: String,
    },

    /// A source is registered but currently disabled (e.g. circuit-broken).
    #[error("source {name} is disabled")]
    SourceDisabled {
        /// The disabled source's name.
        name: String,
    },

    /// An argument supplied by a caller failed validation.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The engine's configuration failed validation at build time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether retrying the operation that produced this error is worthwhile.
    ///
    /// Mirrors the teacher's `is_actionable()` predicate: timeouts, rate
    /// limits, and upstream 5xx-shaped API errors are retryable; auth
    /// failures, unsupported/disabled sources, and caller mistakes are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::SourceApi { status, .. } => status.is_none_or(|s| s >= 500),
            Self::Unauthorized { .. }
            | Self::BatchSizeExceeded { .. }
            | Self::SourceUnsupported { .. }
            | Self::SourceDisabled { .. }
            | Self::PriceNotFound { .. }
            | Self::InvalidArg(_)
            | Self::Config(_) => false,
        }
    }

    /// The HTTP status code this error would map to, for callers that expose
    /// an HTTP surface on top of the engine. The engine itself never formats
    /// a response; this is a classification hint only.
    #[must_use]
    pub fn status_hint(&self) -> u16 {
        match self {
            Self::PriceNotFound { .. } => 404,
            Self::Unauthorized { .. } => 401,
            Self::RateLimited { .. } => 429,
            Self::BatchSizeExceeded { .. } | Self::InvalidArg(_) | Self::Config(_) => 400,
            Self::SourceApi { status, .. } => match status {
                Some(s) if (400..500).contains(s) => 400,
                _ => 502,
            },
            Self::Timeout { .. } => 408,
            Self::SourceUnsupported { .. } => 404,
            Self::SourceDisabled { .. } => 404,
        }
    }

    /// Shorthand for [`EngineError::PriceNotFound`].
    #[must_use]
    pub fn price_not_found(pair: impl Into<String>, source: SourceName) -> Self {
        Self::PriceNotFound {
            pair: pair.into(),
            source,
        }
    }

    /// Shorthand for [`EngineError::Timeout`].
    #[must_use]
    pub fn timeout(source: SourceName, pair: impl Into<String>, ttl_ms: u64) -> Self {
        Self::Timeout {
            source,
            pair: pair.into(),
            ttl_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_and_timeout_are_retryable() {
        assert!(EngineError::RateLimited {
            source: SourceName::Binance
        }
        .is_retryable());
        assert!(EngineError::timeout(SourceName::Okx, "BTC/USDT", 2_000).is_retryable());
    }

    #[test]
    fn unauthorized_is_not_retryable() {
        assert!(!EngineError::Unauthorized {
            source: SourceName::Kraken
        }
        .is_retryable());
    }

    #[test]
    fn price_not_found_is_not_retryable() {
        assert!(!EngineError::price_not_found("BTC/USDT", SourceName::Binance).is_retryable());
    }

    #[test]
    fn source_disabled_maps_to_404() {
        assert_eq!(
            EngineError::SourceDisabled {
                name: "binance".to_string()
            }
            .status_hint(),
            404
        );
    }

    #[test]
    fn status_hint_maps_known_variants() {
        assert_eq!(
            EngineError::RateLimited {
                source: SourceName::Binance
            }
            .status_hint(),
            429
        );
        assert_eq!(
            EngineError::SourceApi {
                source: SourceName::Binance,
                status: Some(503)
            }
            .status_hint(),
            502
        );
        assert_eq!(
            EngineError::SourceApi {
                source: SourceName::Binance,
                status: Some(404)
            }
            .status_hint(),
            400
        );
    }
}
