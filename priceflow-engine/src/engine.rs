//! Engine orchestrator (§6): wires components D-M together from a validated
//! [`EngineConfig`] and a caller-supplied set of adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use priceflow_core::{EngineError, Pair, QuoteResponse, SourceAdapter, SourceName};
use priceflow_types::EngineConfig;

use crate::cache::{TtlCache, TtlPolicy};
use crate::cleanup::PairCleanupScheduler;
use crate::quotes::{MaxBatchSizes, QuotesService};
use crate::refetch::{RefetchScheduler, SourceRefetchMeta};
use crate::registry::PairRegistry;
use crate::retry::FailedPairsRetryQueue;
use crate::sources::SourcesManager;
use crate::streaming::StreamingCoordinator;

/// The fully assembled pricing engine: every component from the sources
/// manager down to the streaming coordinator, ready to serve `get_quote`.
pub struct Engine {
    quotes: Arc<QuotesService>,
    registry: Arc<PairRegistry>,
    sources: Arc<SourcesManager>,
    cache: Arc<TtlCache>,
    retry_queue: Arc<FailedPairsRetryQueue>,
    refetch: Arc<RefetchScheduler>,
    streaming: Arc<StreamingCoordinator>,
    cleanup: Arc<PairCleanupScheduler>,
}

impl Engine {
    /// Start a builder with no adapters registered.
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Resolve a quote for `(source, pair)` through the quotes service
    /// (§4.H): cache hit, else a single-flighted, possibly batched, upstream
    /// fetch.
    pub async fn get_quote(&self, source: &SourceName, pair: &Pair) -> Result<QuoteResponse, EngineError> {
        self.quotes.get_quote(source, pair).await
    }

    /// The pair registry, for callers that need registration introspection.
    #[must_use]
    pub fn registry(&self) -> &Arc<PairRegistry> {
        &self.registry
    }

    /// The sources manager, for callers that need adapter introspection.
    #[must_use]
    pub fn sources(&self) -> &Arc<SourcesManager> {
        &self.sources
    }

    /// Snapshot of pairs currently awaiting a failed-fetch retry.
    #[must_use]
    pub fn retry_status(&self) -> Vec<priceflow_core::RetryMetadata> {
        self.retry_queue.get_retry_status()
    }

    /// Run a pair-cleanup sweep immediately, returning the number of
    /// registrations removed.
    pub fn run_cleanup_now(&self) -> usize {
        self.cleanup.run_once()
    }

    /// Gracefully tear down streaming subscriptions. Background tasks
    /// (cache timer, retry scan, cleanup sweep) stop themselves on drop.
    pub async fn shutdown(&self) {
        self.streaming.shutdown().await;
    }
}

/// Builds an [`Engine`] from a validated [`EngineConfig`] plus one adapter
/// per configured, enabled source.
pub struct EngineBuilder {
    config: EngineConfig,
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl EngineBuilder {
    /// Start with the given configuration and no adapters registered.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config, adapters: Vec::new() }
    }

    /// Register an adapter. Adapters for sources absent from the
    /// configuration, or configured but disabled, are accepted here and
    /// simply excluded from the built engine's active set.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Validate the configuration and assemble every component.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] if `EngineConfig::validate` rejects
    /// the configuration (out-of-range fields, a source requiring an API
    /// key enabled without one, etc).
    pub fn build(mut self) -> Result<Engine, EngineError> {
        self.config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let mut sources = SourcesManager::new();
        let mut source_default_ttl = HashMap::new();
        let mut max_batch_sizes = MaxBatchSizes::new();
        let mut refetch_meta: HashMap<SourceName, SourceRefetchMeta> = HashMap::new();

        for adapter in self.adapters {
            let name = adapter.name();
            // The validated `EngineConfig.sources` entry, keyed by source
            // name, is authoritative when present; it's what `validate()`
            // checked, so it's what tunes the engine. Adapters that aren't
            // named there fall back to whatever config they carry.
            let cfg = match self.config.sources.get(name.as_str()) {
                Some(configured) => configured.clone(),
                None => adapter.get_config(),
            };
            if !cfg.enabled {
                continue;
            }
            source_default_ttl.insert(name.clone(), Duration::from_millis(cfg.ttl_ms));
            let max_batch_size = cfg.max_batch_size.unwrap_or(1);
            max_batch_sizes.insert(name.clone(), max_batch_size);
            refetch_meta.insert(
                name.clone(),
                SourceRefetchMeta { refetch: cfg.refetch, max_batch_size },
            );
            sources.register(adapter);
        }

        let sources = Arc::new(sources);
        let registry = Arc::new(PairRegistry::new());

        let policy = TtlPolicy {
            source_default: source_default_ttl,
            overrides: self.config.pairs_ttl,
            stale_trigger_before_expiry: Duration::from_millis(self.config.refetch.stale_trigger_before_expiry_ms),
            batch_interval: Duration::from_millis(self.config.refetch.batch_interval_ms),
            min_time_between_refreshes: Duration::from_millis(self.config.refetch.min_time_between_refreshes_ms),
        };
        let cache = Arc::new(TtlCache::new(policy));

        let retry_queue = Arc::new(FailedPairsRetryQueue::new(self.config.refetch.failed_pairs_retry));

        let refetch = RefetchScheduler::new(
            Arc::clone(&sources),
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&retry_queue),
            self.config.refetch,
            refetch_meta,
        );
        if let Some(stale_rx) = cache.take_stale_batch_receiver() {
            refetch.start(stale_rx);
        }

        let streaming = StreamingCoordinator::new(Arc::clone(&sources), Arc::clone(&registry), Arc::clone(&cache));

        let cleanup = Arc::new(PairCleanupScheduler::new(Arc::clone(&registry), self.config.pair_cleanup));

        let quotes = Arc::new(QuotesService::new(
            Arc::clone(&sources),
            Arc::clone(&registry),
            Arc::clone(&cache),
            max_batch_sizes,
        ));

        Ok(Engine {
            quotes,
            registry,
            sources,
            cache,
            retry_queue,
            refetch,
            streaming,
            cleanup,
        })
    }
}

impl Engine {
    /// Warm up every refetch-enabled source's currently-registered pairs,
    /// then start streaming subscriptions. Call once at application
    /// bootstrap, after [`EngineBuilder::build`].
    pub async fn start(&self) {
        self.refetch.warm_up().await;
        self.streaming.start().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use priceflow_core::{Price, Quote, SourceAdapterConfig};
    use priceflow_mock::dynamic::DynamicMockAdapter;
    use priceflow_types::SourceConfig;
    use std::time::SystemTime;

    fn minimal_config() -> EngineConfig {
        let mut sources = HashMap::new();
        sources.insert(
            "binance".to_string(),
            SourceConfig { refetch: false, ..SourceConfig::default() },
        );
        EngineConfig {
            sources,
            pair_cleanup: priceflow_types::PairCleanupConfig { enabled: false, ..priceflow_types::PairCleanupConfig::default() },
            refetch: priceflow_types::RefetchConfig {
                enabled: false,
                failed_pairs_retry: priceflow_types::FailedPairsRetryConfig { enabled: false, ..Default::default() },
                ..priceflow_types::RefetchConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn build_then_get_quote_round_trips_through_cache() {
        let (adapter, controller) =
            DynamicMockAdapter::new_with_controller(SourceName::Binance, SourceAdapterConfig::default());
        let pair = Pair::new("BTC", "USDT").unwrap();
        controller
            .set_quote_behavior(
                &pair,
                priceflow_mock::MockBehavior::Return(Quote {
                    pair: pair.clone(),
                    price: Price::parse("67890.12").unwrap(),
                    received_at: SystemTime::now(),
                }),
            )
            .await;

        let engine = Engine::builder(minimal_config()).with_adapter(adapter).build().unwrap();

        let first = engine.get_quote(&SourceName::Binance, &pair).await.unwrap();
        assert_eq!(first.price.as_str(), "67890.12");

        let second = engine.get_quote(&SourceName::Binance, &pair).await.unwrap();
        assert_eq!(second.price.as_str(), "67890.12");
        assert_eq!(controller.get_subscribe_log().await.len(), 0);
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = minimal_config();
        config.refetch.stale_trigger_before_expiry_ms = 0;
        let err = Engine::builder(config).build().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
