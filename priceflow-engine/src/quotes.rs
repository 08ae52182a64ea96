//! Quotes service (§4.H): the front door every client request goes through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use priceflow_core::{EngineError, Pair, QuoteResponse, SourceName};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::batch::BatchCoordinator;
use crate::cache::TtlCache;
use crate::metrics;
use crate::registry::PairRegistry;
use crate::sources::SourcesManager;

type SingleFlightKey = (SourceName, Pair);
type SingleFlightResult = Result<QuoteResponse, EngineError>;

/// Per-source `max_batch_size`, consulted by [`QuotesService::get_quote`]
/// before attempting a batched fetch.
pub type MaxBatchSizes = HashMap<SourceName, usize>;

/// The canonical single-flighted `getQuote` entry point (§9: "this spec
/// takes the single-flight version as canonical").
pub struct QuotesService {
    sources: Arc<SourcesManager>,
    registry: Arc<PairRegistry>,
    cache: Arc<TtlCache>,
    max_batch_sizes: MaxBatchSizes,
    inflight: AsyncMutex<HashMap<SingleFlightKey, broadcast::Sender<SingleFlightResult>>>,
}

impl QuotesService {
    /// Wire up the service against its shared collaborators.
    #[must_use]
    pub fn new(
        sources: Arc<SourcesManager>,
        registry: Arc<PairRegistry>,
        cache: Arc<TtlCache>,
        max_batch_sizes: MaxBatchSizes,
    ) -> Self {
        Self {
            sources,
            registry,
            cache,
            max_batch_sizes,
            inflight: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Resolve a quote for `(source, pair)`: cache hit, else a single-flighted
    /// upstream fetch (batched when available), caching and registering the
    /// outcome.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn get_quote(&self, source: &SourceName, pair: &Pair) -> SingleFlightResult {
        self.registry.track_quote_request(source, pair);

        if let Some(cached) = self.cache.get(source, pair) {
            metrics::cache_hit(source.as_str());
            self.registry.track_response(source, pair);
            if let Ok(age) = std::time::SystemTime::now().duration_since(cached.cached_at) {
                metrics::quote_data_age_seconds(source.as_str(), &pair.pair_key(), age);
            }
            return Ok(QuoteResponse {
                source: source.clone(),
                pair: pair.clone(),
                price: cached.quote.price,
                received_at: cached.quote.received_at,
            });
        }

        metrics::cache_miss(source.as_str());
        metrics::cache_miss_by_pair(source.as_str(), &pair.pair_key());

        let key = (source.clone(), pair.clone());
        let mut joined = {
            let mut inflight = self.inflight.lock().await;
            if let Some(tx) = inflight.get(&key) {
                Some(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(key.clone(), tx);
                None
            }
        };

        if let Some(ref mut rx) = joined {
            return rx.recv().await.unwrap_or_else(|_| {
                Err(EngineError::price_not_found(pair.pair_key(), source.clone()))
            });
        }

        let result = self.resolve_quote(source, pair).await;

        let tx = self.inflight.lock().await.remove(&key);
        if let Some(tx) = tx {
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn resolve_quote(&self, source: &SourceName, pair: &Pair) -> SingleFlightResult {
        let coordinator = BatchCoordinator::new(&self.sources, &self.registry, &self.cache);
        let max_batch_size = self.max_batch_sizes.get(source).copied().unwrap_or(1);

        if self.sources.is_fetch_quotes_supported(source) && max_batch_size > 1 {
            let batch = coordinator.build_batch(source, pair, max_batch_size);
            if batch.len() > 1
                && let Ok(quote) = coordinator.fetch_with_batch(source, pair, &batch).await
            {
                return Ok(QuoteResponse {
                    source: source.clone(),
                    pair: pair.clone(),
                    price: quote.price,
                    received_at: quote.received_at,
                });
            }
        }

        match self.sources.fetch_quote(source, pair).await {
            Ok(quote) => {
                self.cache.set(source, pair, quote.clone(), None);
                self.registry.track_successful_fetch(source, pair);
                self.registry.track_response(source, pair);
                metrics::source_last_update_age_seconds(source.as_str(), &pair.pair_key(), Duration::ZERO);
                Ok(QuoteResponse {
                    source: source.clone(),
                    pair: pair.clone(),
                    price: quote.price,
                    received_at: quote.received_at,
                })
            }
            Err(error @ (EngineError::PriceNotFound { .. } | EngineError::Unauthorized { .. })) => {
                metrics::quote_request_error(source.as_str(), &pair.pair_key());
                if matches!(error, EngineError::PriceNotFound { .. }) {
                    metrics::price_not_found(source.as_str(), &pair.pair_key());
                }
                self.registry.remove_pair_source(source, pair);
                Err(error)
            }
            Err(error) => {
                metrics::quote_request_error(source.as_str(), &pair.pair_key());
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use priceflow_core::{Price, Quote, SourceAdapterConfig};
    use priceflow_mock::dynamic::{DynamicMockAdapter, MockBehavior};
    use std::time::SystemTime;

    fn service(max_batch: MaxBatchSizes) -> (QuotesService, priceflow_mock::DynamicMockController) {
        let mut sources = SourcesManager::new();
        let (adapter, controller) =
            DynamicMockAdapter::new_with_controller(SourceName::Okx, SourceAdapterConfig::default());
        sources.register(adapter);
        let registry = Arc::new(PairRegistry::new());
        let cache = Arc::new(TtlCache::new(crate::cache::TtlPolicy {
            source_default: HashMap::from([(SourceName::Okx, Duration::from_secs(5))]),
            overrides: Vec::new(),
            stale_trigger_before_expiry: Duration::from_millis(1000),
            batch_interval: Duration::from_millis(300),
            min_time_between_refreshes: Duration::from_millis(2000),
        }));
        (
            QuotesService::new(Arc::new(sources), registry, cache, max_batch),
            controller,
        )
    }

    #[tokio::test]
    async fn cache_hit_skips_upstream() {
        let (svc, controller) = service(MaxBatchSizes::new());
        let pair = Pair::new("BTC", "USDT").unwrap();
        svc.cache.set(
            &SourceName::Okx,
            &pair,
            Quote {
                pair: pair.clone(),
                price: Price::parse("100").unwrap(),
                received_at: SystemTime::now(),
            },
            None,
        );
        let got = svc.get_quote(&SourceName::Okx, &pair).await.unwrap();
        assert_eq!(got.price.as_str(), "100");
        assert!(controller.get_subscribe_log().await.is_empty());
    }

    #[tokio::test]
    async fn price_not_found_deregisters_pair() {
        let (svc, controller) = service(MaxBatchSizes::new());
        let pair = Pair::new("XYZ", "USD").unwrap();
        controller
            .set_quote_behavior(
                &pair,
                MockBehavior::Fail(EngineError::price_not_found(pair.pair_key(), SourceName::Okx)),
            )
            .await;
        let err = svc.get_quote(&SourceName::Okx, &pair).await.unwrap_err();
        assert!(matches!(err, EngineError::PriceNotFound { .. }));
        assert!(svc.registry.get_pairs_by_source(&SourceName::Okx).is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_single_flight_to_one_upstream_call() {
        let (svc, controller) = service(MaxBatchSizes::new());
        let svc = Arc::new(svc);
        let pair = Pair::new("BTC", "USDT").unwrap();
        controller
            .set_quote_behavior(
                &pair,
                MockBehavior::Return(Quote {
                    pair: pair.clone(),
                    price: Price::parse("67890.12").unwrap(),
                    received_at: SystemTime::now(),
                }),
            )
            .await;

        let (a, b) = tokio::join!(
            { let svc = Arc::clone(&svc); let pair = pair.clone(); async move { svc.get_quote(&SourceName::Okx, &pair).await } },
            { let svc = Arc::clone(&svc); let pair = pair.clone(); async move { svc.get_quote(&SourceName::Okx, &pair).await } },
        );
        assert_eq!(a.unwrap().price.as_str(), "67890.12");
        assert_eq!(b.unwrap().price.as_str(), "67890.12");
    }
}
