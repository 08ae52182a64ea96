//! Configuration schema for the pricing engine.
//!
//! These are the Rust types the engine is *built from* — parsing them out of
//! a file or environment variables is out of scope here; only the typed
//! shape and its validation rules live in this crate.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment environment, used to gate dev-only conveniences (pretty logs,
/// relaxed validation messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Production deployment.
    Production,
    /// Automated test runs.
    Test,
}

/// Logger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Minimum level emitted (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Whether to use a human-readable, colorized formatter instead of JSON.
    pub is_pretty_enabled: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            is_pretty_enabled: false,
        }
    }
}

/// Proxy setting shared by the root config and per-source overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxySetting {
    /// No proxy.
    #[default]
    Disabled,
    /// Use the process-level default proxy.
    Enabled(bool),
    /// Use a specific proxy URL.
    Url(String),
}

/// Exponential backoff configuration for reconnecting streaming sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Minimum backoff delay in milliseconds.
    pub min_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Exponential factor to increase delay after each failure (>= 1).
    pub factor: u32,
    /// Random jitter percentage [0, 100] added to each delay.
    pub jitter_percent: u8,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 500,
            max_backoff_ms: 30_000,
            factor: 2,
            jitter_percent: 20,
        }
    }
}

/// Failed-pair retry queue configuration (component K).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FailedPairsRetryConfig {
    /// Whether the retry queue is active.
    pub enabled: bool,
    /// Maximum attempts before a pair is dropped from the queue. Range `[1, 1000]`.
    pub max_attempts: u32,
    /// Delay before a failed pair becomes eligible for retry, in milliseconds. Range `[1000, 3_600_000]`.
    pub retry_delay_ms: u64,
    /// How often the queue is scanned for due retries, in milliseconds. Range `[5000, 300_000]`.
    pub check_interval_ms: u64,
}

impl Default for FailedPairsRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            retry_delay_ms: 30_000,
            check_interval_ms: 15_000,
        }
    }
}

/// Proactive refetch / staleness configuration (components F and I).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefetchConfig {
    /// Whether proactive refetch is active at all.
    pub enabled: bool,
    /// How long before expiry the stale timer fires, in milliseconds. Range `[100, 60_000]`.
    pub stale_trigger_before_expiry_ms: u64,
    /// Debounce window for batching stale items before emission, in milliseconds. Range `[100, 10_000]`.
    pub batch_interval_ms: u64,
    /// Minimum time between two refreshes of the same pair, in milliseconds. Range `[100, 60_000]`.
    pub min_time_between_refreshes_ms: u64,
    /// Failed-pair retry queue configuration.
    pub failed_pairs_retry: FailedPairsRetryConfig,
}

impl Default for RefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_trigger_before_expiry_ms: 5_000,
            batch_interval_ms: 1_000,
            min_time_between_refreshes_ms: 2_000,
            failed_pairs_retry: FailedPairsRetryConfig::default(),
        }
    }
}

/// Pair cleanup scheduler configuration (component L).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PairCleanupConfig {
    /// Whether the cleanup scheduler runs at all.
    pub enabled: bool,
    /// A `(pair, source)` registration is removed once inactive for this
    /// long, in milliseconds. Range `[60_000, 86_400_000]`.
    pub inactive_timeout_ms: u64,
    /// How often the cleanup sweep runs, in milliseconds. Range `[5000, 3_600_000]`.
    pub cleanup_interval_ms: u64,
}

impl Default for PairCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inactive_timeout_ms: 3_600_000,
            cleanup_interval_ms: 300_000,
        }
    }
}

/// A per-pair TTL override. A `source` of `None` is a wildcard matching any
/// source; when several overrides match the same `(pair, source)`, the
/// first one in configuration order wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairTtlOverride {
    /// The pair this override applies to, as `(base, quote)`.
    pub pair: (String, String),
    /// The source this override is scoped to, or `None` for any source.
    pub source: Option<String>,
    /// The TTL to apply, in milliseconds. Must be `>= 1000`.
    pub ttl_ms: u64,
}

/// Streaming-specific configuration for a single source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Whether to automatically reconnect on disconnect.
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Maximum reconnect attempts before giving up. Range `[0, 100]`.
    pub max_reconnect_attempts: u32,
    /// Heartbeat interval, in milliseconds. Must be `>= 5000`.
    pub heartbeat_interval_ms: u64,
    /// Override WebSocket URL.
    pub ws_url: Option<String>,
    /// Subscription batch size, if the provider's wire protocol batches
    /// subscribe messages.
    pub batch_size: Option<usize>,
    /// Optional subscribe-message rate limit (messages per second).
    pub rate_limit: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval_ms: 1_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            ws_url: None,
            batch_size: None,
            rate_limit: None,
        }
    }
}

/// Per-source configuration (also exposed to adapters as
/// `priceflow_core::SourceAdapterConfig`; this is the config-schema twin
/// that gets validated and loaded before an adapter is built from it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Whether this source is used at all.
    pub enabled: bool,
    /// API key, required for sources that need one.
    pub api_key: Option<String>,
    /// Cache TTL in milliseconds. Must be `>= 1000`.
    pub ttl_ms: u64,
    /// Maximum concurrent in-flight requests. Must be `>= 1`.
    pub max_concurrent: u32,
    /// Per-request timeout in milliseconds. Must be `>= 1000`.
    pub timeout_ms: u64,
    /// Requests-per-second budget; `None` means unlimited. Must be `> 0` if set.
    pub rps: Option<f64>,
    /// Proxy usage for this source's requests.
    pub use_proxy: ProxySetting,
    /// Maximum fetch retries. Range `[0, 10]`.
    pub max_retries: u32,
    /// Whether this source participates in proactive refetch.
    pub refetch: bool,
    /// Streaming configuration, if this source streams.
    pub stream: Option<StreamConfig>,
    /// Override base URL for this source's REST API.
    pub base_url: Option<String>,
    /// Maximum pairs per batch request, if the adapter supports batching.
    pub max_batch_size: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            ttl_ms: 5_000,
            max_concurrent: 10,
            timeout_ms: 5_000,
            rps: None,
            use_proxy: ProxySetting::Disabled,
            max_retries: 3,
            refetch: true,
            stream: None,
            base_url: None,
            max_batch_size: None,
        }
    }
}

/// Root engine configuration — recognized options, exhaustive per the
/// external interface contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// HTTP port, if this deployment exposes one (the HTTP surface itself
    /// is out of scope for this crate; the port is carried for parity with
    /// the full configuration schema).
    pub port: u16,
    /// Deployment environment.
    pub environment: Environment,
    /// Optional path to a pairs universe file.
    pub pairs_file_path: Option<String>,
    /// Logger configuration.
    pub logger: LoggerConfig,
    /// Default proxy setting, overridable per source.
    pub proxy: Option<ProxySetting>,
    /// Proactive refetch configuration.
    pub refetch: RefetchConfig,
    /// Pair cleanup scheduler configuration.
    pub pair_cleanup: PairCleanupConfig,
    /// Per-pair TTL overrides, checked in order; first match wins.
    pub pairs_ttl: Vec<PairTtlOverride>,
    /// Per-source configuration, keyed by source name.
    pub sources: HashMap<String, SourceConfig>,
    /// Opaque market-data forwarding configuration; shape is deployment-specific.
    pub market_data: Option<serde_json::Value>,
    /// Opaque metrics-push configuration; shape is deployment-specific.
    pub metrics_push: Option<serde_json::Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            environment: Environment::default(),
            pairs_file_path: None,
            logger: LoggerConfig::default(),
            proxy: None,
            refetch: RefetchConfig::default(),
            pair_cleanup: PairCleanupConfig::default(),
            pairs_ttl: Vec::new(),
            sources: HashMap::new(),
            market_data: None,
            metrics_push: None,
        }
    }
}

/// Sources that require an API key to be considered configured.
///
/// Any source name not in this list is usable with `api_key: None`.
const SOURCES_REQUIRING_API_KEY: &[&str] = &["cryptocompare", "finnhub", "alphavantage"];

/// An error produced while validating an [`EngineConfig`].
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// A numeric field fell outside its documented range.
    #[error("{field} must be in range [{min}, {max}], got {actual}")]
    OutOfRange {
        /// The offending field's name.
        field: String,
        /// The minimum allowed value.
        min: u64,
        /// The maximum allowed value.
        max: u64,
        /// The value that was supplied.
        actual: u64,
    },
    /// A source that requires an API key was enabled without one.
    #[error("source {source} requires an api_key when enabled")]
    MissingApiKey {
        /// The source missing its key.
        source: String,
    },
    /// A source's `rps` was set to a non-positive value.
    #[error("source {source} rps must be > 0 when set, got {rps}")]
    InvalidRps {
        /// The offending source.
        source: String,
        /// The invalid rps value.
        rps: f64,
    },
}

impl EngineConfig {
    /// Validate this configuration against the documented ranges and
    /// cross-field rules.
    ///
    /// Sources that require an API key but were enabled without one are
    /// not an error: they're silently disabled, per the spec's validation
    /// rule. All other violations are hard errors.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] encountered.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        check_range(
            "refetch.stale_trigger_before_expiry_ms",
            self.refetch.stale_trigger_before_expiry_ms,
            100,
            60_000,
        )?;
        check_range(
            "refetch.batch_interval_ms",
            self.refetch.batch_interval_ms,
            100,
            10_000,
        )?;
        check_range(
            "refetch.min_time_between_refreshes_ms",
            self.refetch.min_time_between_refreshes_ms,
            100,
            60_000,
        )?;
        check_range(
            "refetch.failed_pairs_retry.max_attempts",
            u64::from(self.refetch.failed_pairs_retry.max_attempts),
            1,
            1_000,
        )?;
        check_range(
            "refetch.failed_pairs_retry.retry_delay_ms",
            self.refetch.failed_pairs_retry.retry_delay_ms,
            1_000,
            3_600_000,
        )?;
        check_range(
            "refetch.failed_pairs_retry.check_interval_ms",
            self.refetch.failed_pairs_retry.check_interval_ms,
            5_000,
            300_000,
        )?;
        check_range(
            "pair_cleanup.inactive_timeout_ms",
            self.pair_cleanup.inactive_timeout_ms,
            60_000,
            86_400_000,
        )?;
        check_range(
            "pair_cleanup.cleanup_interval_ms",
            self.pair_cleanup.cleanup_interval_ms,
            5_000,
            3_600_000,
        )?;
        for ov in &self.pairs_ttl {
            if ov.ttl_ms < 1_000 {
                return Err(ConfigError::OutOfRange {
                    field: "pairs_ttl[].ttl_ms".to_string(),
                    min: 1_000,
                    max: u64::MAX,
                    actual: ov.ttl_ms,
                });
            }
        }

        for (name, source) in &mut self.sources {
            if !source.enabled {
                continue;
            }
            check_range(&format!("sources.{name}.ttl_ms"), source.ttl_ms, 1_000, u64::MAX)?;
            check_range(
                &format!("sources.{name}.max_concurrent"),
                u64::from(source.max_concurrent),
                1,
                u64::MAX,
            )?;
            check_range(
                &format!("sources.{name}.timeout_ms"),
                source.timeout_ms,
                1_000,
                u64::MAX,
            )?;
            check_range(
                &format!("sources.{name}.max_retries"),
                u64::from(source.max_retries),
                0,
                10,
            )?;
            if let Some(rps) = source.rps
                && rps <= 0.0
            {
                return Err(ConfigError::InvalidRps {
                    source: name.clone(),
                    rps,
                });
            }
            if let Some(stream) = &source.stream {
                check_range(
                    &format!("sources.{name}.stream.max_reconnect_attempts"),
                    u64::from(stream.max_reconnect_attempts),
                    0,
                    100,
                )?;
                check_range(
                    &format!("sources.{name}.stream.heartbeat_interval_ms"),
                    stream.heartbeat_interval_ms,
                    5_000,
                    u64::MAX,
                )?;
            }
            if SOURCES_REQUIRING_API_KEY.contains(&name.as_str())
                && source.api_key.as_deref().unwrap_or_default().is_empty()
            {
                source.enabled = false;
            }
        }
        Ok(())
    }
}

fn check_range(field: &str, actual: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if actual < min || actual > max {
        return Err(ConfigError::OutOfRange {
            field: field.to_string(),
            min,
            max,
            actual,
        });
    }
    Ok(())
}

/// Convert a millisecond count from the config schema into a [`Duration`].
#[must_use]
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn out_of_range_refetch_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.refetch.batch_interval_ms = 50;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn source_requiring_api_key_is_silently_disabled_not_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.sources.insert(
            "cryptocompare".to_string(),
            SourceConfig {
                api_key: None,
                ..SourceConfig::default()
            },
        );
        assert!(cfg.validate().is_ok());
        assert!(!cfg.sources["cryptocompare"].enabled);
    }

    #[test]
    fn pairs_ttl_override_below_minimum_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.pairs_ttl.push(PairTtlOverride {
            pair: ("BTC".to_string(), "USDT".to_string()),
            source: None,
            ttl_ms: 10,
        });
        assert!(cfg.validate().is_err());
    }
}
