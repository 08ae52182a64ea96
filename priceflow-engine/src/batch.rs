//! Batch coordinator (§4.G): assembling and executing multi-pair fetches.

use std::time::Duration;

use priceflow_core::{EngineError, Pair, Quote, SourceName};

use crate::cache::TtlCache;
use crate::metrics;
use crate::registry::PairRegistry;
use crate::sources::SourcesManager;

/// Builds and executes batched upstream fetches, backfilling the cache and
/// registry from every quote a batch call returns.
pub struct BatchCoordinator<'a> {
    sources: &'a SourcesManager,
    registry: &'a PairRegistry,
    cache: &'a TtlCache,
}

impl<'a> BatchCoordinator<'a> {
    /// Borrow the three collaborators this coordinator needs.
    #[must_use]
    pub const fn new(sources: &'a SourcesManager, registry: &'a PairRegistry, cache: &'a TtlCache) -> Self {
        Self { sources, registry, cache }
    }

    /// Build the batch for `requested_pair`: itself first, then other
    /// same-source registrations ordered oldest-`last_fetch_at`-first, up
    /// to `max_batch_size`.
    #[must_use]
    pub fn build_batch(&self, source: &SourceName, requested_pair: &Pair, max_batch_size: usize) -> Vec<Pair> {
        let mut batch = vec![requested_pair.clone()];
        if max_batch_size <= 1 {
            return batch;
        }
        let mut others = self.registry.get_pairs_by_source_with_timestamps(source);
        others.retain(|(pair, _)| pair != requested_pair);
        others.sort_by_key(|(_, last_fetch_at)| *last_fetch_at);
        for (pair, _) in others {
            if batch.len() >= max_batch_size {
                break;
            }
            batch.push(pair);
        }
        batch
    }

    /// Fetch a batch upstream, cache every returned quote, and return the
    /// one matching `requested_pair`.
    ///
    /// # Errors
    /// `PriceNotFound` if the batch call succeeds but omits the requested
    /// pair; otherwise propagates the upstream failure unchanged.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, batch)))]
    pub async fn fetch_with_batch(
        &self,
        source: &SourceName,
        requested_pair: &Pair,
        batch: &[Pair],
    ) -> Result<Quote, EngineError> {
        let quotes = self.sources.fetch_quotes(source, batch).await?;
        let mut found = None;
        for quote in quotes {
            self.cache.set(source, &quote.pair, quote.clone(), None);
            self.registry.track_successful_fetch(source, &quote.pair);
            self.registry.track_response(source, &quote.pair);
            metrics::source_last_update_age_seconds(source.as_str(), &quote.pair.pair_key(), Duration::ZERO);
            if &quote.pair == requested_pair {
                found = Some(quote);
            }
        }
        found.ok_or_else(|| EngineError::price_not_found(requested_pair.pair_key(), source.clone()))
    }

    /// Chunk `pairs` into `max_batch_size`-sized groups and fetch them in
    /// parallel, isolating per-chunk failures. Returns the count of quotes
    /// successfully cached.
    pub async fn prefetch_batch(&self, source: &SourceName, pairs: &[Pair], max_batch_size: usize) -> usize {
        if pairs.is_empty() || max_batch_size == 0 {
            return 0;
        }
        let chunks: Vec<&[Pair]> = pairs.chunks(max_batch_size).collect();
        let results = futures::future::join_all(chunks.into_iter().map(|chunk| async move {
            match self.sources.fetch_quotes(source, chunk).await {
                Ok(quotes) => quotes.len(),
                Err(error) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%source, %error, "prefetch chunk failed, isolating");
                    #[cfg(not(feature = "tracing"))]
                    let _ = error;
                    0
                }
            }
        }))
        .await;
        results.into_iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use priceflow_core::SourceAdapterConfig;
    use priceflow_mock::dynamic::{DynamicMockAdapter, MockBehavior};
    use std::time::SystemTime;

    fn sample_quote(pair: &Pair, price: &str) -> Quote {
        Quote {
            pair: pair.clone(),
            price: priceflow_core::Price::parse(price).unwrap(),
            received_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn build_batch_places_requested_pair_first_and_respects_max() {
        let registry = PairRegistry::new();
        let btc = Pair::new("BTC", "USDT").unwrap();
        let eth = Pair::new("ETH", "USDT").unwrap();
        let sol = Pair::new("SOL", "USDT").unwrap();
        for pair in [&btc, &eth, &sol] {
            registry.track_quote_request(&SourceName::Binance, pair);
        }

        let mut sources = SourcesManager::new();
        let (adapter, _ctrl) =
            DynamicMockAdapter::new_with_controller(SourceName::Binance, SourceAdapterConfig::default());
        sources.register(adapter);
        let cache = TtlCache::new(crate::cache::TtlPolicy {
            source_default: std::collections::HashMap::new(),
            overrides: Vec::new(),
            stale_trigger_before_expiry: Duration::from_millis(1000),
            batch_interval: Duration::from_millis(300),
            min_time_between_refreshes: Duration::from_millis(2000),
        });
        let coordinator = BatchCoordinator::new(&sources, &registry, &cache);

        let batch = coordinator.build_batch(&SourceName::Binance, &eth, 2);
        assert_eq!(batch[0], eth);
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn fetch_with_batch_caches_all_returned_quotes() {
        let registry = PairRegistry::new();
        let btc = Pair::new("BTC", "USDT").unwrap();
        let eth = Pair::new("ETH", "USDT").unwrap();
        let sol = Pair::new("SOL", "USDT").unwrap();

        let mut sources = SourcesManager::new();
        let (adapter, controller) =
            DynamicMockAdapter::new_with_controller(SourceName::Binance, SourceAdapterConfig::default());
        controller
            .set_batch_behavior(MockBehavior::Return(vec![
                sample_quote(&btc, "67890.12"),
                sample_quote(&eth, "3456.78"),
                sample_quote(&sol, "145.22"),
            ]))
            .await;
        sources.register(adapter);

        let cache = TtlCache::new(crate::cache::TtlPolicy {
            source_default: std::collections::HashMap::from([(SourceName::Binance, Duration::from_secs(5))]),
            overrides: Vec::new(),
            stale_trigger_before_expiry: Duration::from_millis(1000),
            batch_interval: Duration::from_millis(300),
            min_time_between_refreshes: Duration::from_millis(2000),
        });
        let coordinator = BatchCoordinator::new(&sources, &registry, &cache);

        let got = coordinator
            .fetch_with_batch(&SourceName::Binance, &eth, &[btc.clone(), eth.clone(), sol.clone()])
            .await
            .unwrap();
        assert_eq!(got.price.as_str(), "3456.78");
        assert!(cache.get(&SourceName::Binance, &btc).is_some());
        assert!(cache.get(&SourceName::Binance, &sol).is_some());
    }
}
