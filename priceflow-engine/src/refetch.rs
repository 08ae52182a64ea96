//! Refetch scheduler (§4.I): proactive refresh driven by the cache's stale
//! batches, plus boot-time warm-up and failed-pair retry fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as SyncMutex};

use priceflow_core::{Pair, SourceName, StaleBatch};
use priceflow_types::RefetchConfig;
use tokio::sync::mpsc;

use crate::cache::TtlCache;
use crate::registry::PairRegistry;
use crate::retry::FailedPairsRetryQueue;
use crate::sources::SourcesManager;

/// Per-source facts the scheduler needs that aren't owned by any one
/// collaborator: whether the source opts into proactive refetch, and its
/// batch ceiling.
#[derive(Debug, Clone, Copy)]
pub struct SourceRefetchMeta {
    /// Mirrors `SourceConfig::refetch`.
    pub refetch: bool,
    /// Mirrors `SourceConfig::max_batch_size`, defaulting to 1 (no batching).
    pub max_batch_size: usize,
}

type InProgress = SyncMutex<HashSet<(SourceName, Pair)>>;

/// Coordinates proactive refresh of cache entries before they expire.
pub struct RefetchScheduler {
    sources: Arc<SourcesManager>,
    registry: Arc<PairRegistry>,
    cache: Arc<TtlCache>,
    retry_queue: Arc<FailedPairsRetryQueue>,
    config: RefetchConfig,
    source_meta: HashMap<SourceName, SourceRefetchMeta>,
    in_progress: InProgress,
}

impl RefetchScheduler {
    /// Wire up the scheduler. Does not start any background work; call
    /// [`start`](Self::start) once the stale-batch receiver is available.
    #[must_use]
    pub fn new(
        sources: Arc<SourcesManager>,
        registry: Arc<PairRegistry>,
        cache: Arc<TtlCache>,
        retry_queue: Arc<FailedPairsRetryQueue>,
        config: RefetchConfig,
        source_meta: HashMap<SourceName, SourceRefetchMeta>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sources,
            registry,
            cache,
            retry_queue,
            config,
            source_meta,
            in_progress: SyncMutex::new(HashSet::new()),
        })
    }

    /// Start consuming stale batches and register the retry-queue callback.
    /// No-op if `refetch.enabled` is `false`.
    pub fn start(self: &Arc<Self>, stale_rx: mpsc::UnboundedReceiver<StaleBatch>) {
        if !self.config.enabled {
            return;
        }
        let loop_handle = Arc::clone(self);
        tokio::spawn(async move { loop_handle.run_stale_batch_loop(stale_rx).await });

        let callback_handle = Arc::clone(self);
        self.retry_queue.register_retry_callback(move |pairs| {
            let handle = Arc::clone(&callback_handle);
            tokio::spawn(async move { handle.handle_retry_batch(pairs).await });
        });
    }

    async fn run_stale_batch_loop(&self, mut rx: mpsc::UnboundedReceiver<StaleBatch>) {
        while let Some(batch) = rx.recv().await {
            self.handle_stale_batch(batch).await;
        }
    }

    /// Boot-time warm-up: build a `source -> pairs[]` map from every
    /// registration whose source has `refetch = true`, then refresh each
    /// source's pairs concurrently. Call once, after all components are ready.
    pub async fn warm_up(&self) {
        let mut by_source: HashMap<SourceName, Vec<Pair>> = HashMap::new();
        for reg in self.registry.get_all_registrations() {
            if self.source_meta.get(&reg.source).is_some_and(|m| m.refetch) {
                by_source.entry(reg.source).or_default().push(reg.pair);
            }
        }
        let futures = by_source
            .into_iter()
            .map(|(source, pairs)| self.refresh_source_pairs(source, pairs));
        futures::future::join_all(futures).await;
    }

    /// Filter, dedupe against in-flight work, group by source, and fan out
    /// to [`refresh_source_pairs`](Self::refresh_source_pairs).
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, batch)))]
    pub async fn handle_stale_batch(&self, batch: StaleBatch) {
        let mut by_source: HashMap<SourceName, Vec<Pair>> = HashMap::new();
        {
            let mut in_progress = self.in_progress.lock().unwrap();
            for item in batch.items {
                let key = (item.source.clone(), item.pair.clone());
                if in_progress.contains(&key) {
                    continue;
                }
                let still_registered = self
                    .registry
                    .get_sources_by_pair(&item.pair)
                    .contains(&item.source);
                let refetch_enabled = self.source_meta.get(&item.source).is_some_and(|m| m.refetch);
                if !still_registered || !refetch_enabled {
                    continue;
                }
                in_progress.insert(key);
                by_source.entry(item.source).or_default().push(item.pair);
            }
        }
        self.fan_out(by_source).await;
    }

    /// Same filtering/grouping/fan-out as [`handle_stale_batch`](Self::handle_stale_batch),
    /// for pairs surfaced by the failed-pair retry queue.
    pub async fn handle_retry_batch(&self, pairs: Vec<(SourceName, Pair)>) {
        let mut by_source: HashMap<SourceName, Vec<Pair>> = HashMap::new();
        {
            let mut in_progress = self.in_progress.lock().unwrap();
            for (source, pair) in pairs {
                let key = (source.clone(), pair.clone());
                if in_progress.contains(&key) {
                    continue;
                }
                let still_registered = self.registry.get_sources_by_pair(&pair).contains(&source);
                let refetch_enabled = self.source_meta.get(&source).is_some_and(|m| m.refetch);
                if !still_registered || !refetch_enabled {
                    continue;
                }
                in_progress.insert(key);
                by_source.entry(source).or_default().push(pair);
            }
        }
        self.fan_out(by_source).await;
    }

    async fn fan_out(&self, by_source: HashMap<SourceName, Vec<Pair>>) {
        let futures = by_source
            .into_iter()
            .map(|(source, pairs)| self.refresh_source_pairs(source, pairs));
        futures::future::join_all(futures).await;
    }

    /// Refresh `pairs` for `source`: batched if supported and more than one
    /// pair is due, otherwise one fetch per pair in parallel. Per-pair
    /// failures are swallowed and enqueued to the retry queue.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, pairs)))]
    pub async fn refresh_source_pairs(&self, source: SourceName, pairs: Vec<Pair>) {
        let max_batch_size = self.source_meta.get(&source).map_or(1, |m| m.max_batch_size);
        if self.sources.is_fetch_quotes_supported(&source) && pairs.len() > 1 && max_batch_size > 1 {
            for chunk in pairs.chunks(max_batch_size) {
                match self.sources.fetch_quotes(&source, chunk).await {
                    Ok(quotes) => {
                        for quote in quotes {
                            self.cache.set(&source, &quote.pair, quote.clone(), None);
                            self.registry.track_successful_fetch(&source, &quote.pair);
                            self.registry.track_response(&source, &quote.pair);
                            self.retry_queue.remove_from_retry_queue(&source, &quote.pair);
                        }
                    }
                    Err(_error) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(%source, error = %_error, "refresh chunk failed, isolating");
                    }
                }
            }
        } else {
            let source_ref = &source;
            futures::future::join_all(pairs.iter().map(|pair| async move {
                match self.sources.fetch_quote(source_ref, pair).await {
                    Ok(quote) => {
                        self.cache.set(source_ref, pair, quote, None);
                        self.registry.track_successful_fetch(source_ref, pair);
                        self.registry.track_response(source_ref, pair);
                        self.retry_queue.remove_from_retry_queue(source_ref, pair);
                    }
                    Err(_error) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(%source_ref, pair = %pair, error = %_error, "refresh failed, enqueuing retry");
                        self.retry_queue.track_failed_pair(source_ref, pair);
                    }
                }
            }))
            .await;
        }
        let mut in_progress = self.in_progress.lock().unwrap();
        for pair in &pairs {
            in_progress.remove(&(source.clone(), pair.clone()));
        }
        drop(in_progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use priceflow_core::{EngineError, Price, Quote, SourceAdapterConfig};
    use priceflow_mock::dynamic::{DynamicMockAdapter, MockBehavior};
    use priceflow_types::FailedPairsRetryConfig;
    use std::time::{Duration, SystemTime};

    fn meta() -> HashMap<SourceName, SourceRefetchMeta> {
        HashMap::from([(
            SourceName::Binance,
            SourceRefetchMeta { refetch: true, max_batch_size: 1 },
        )])
    }

    #[tokio::test]
    async fn refresh_source_pairs_caches_success_and_clears_retry_entry() {
        let registry = Arc::new(PairRegistry::new());
        let pair = Pair::new("BTC", "USDT").unwrap();
        registry.track_quote_request(&SourceName::Binance, &pair);

        let mut sources = SourcesManager::new();
        let (adapter, controller) =
            DynamicMockAdapter::new_with_controller(SourceName::Binance, SourceAdapterConfig::default());
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
        sources.register(adapter);

        let cache = Arc::new(TtlCache::new(crate::cache::TtlPolicy {
            source_default: HashMap::from([(SourceName::Binance, Duration::from_secs(5))]),
            overrides: Vec::new(),
            stale_trigger_before_expiry: Duration::from_millis(1000),
            batch_interval: Duration::from_millis(300),
            min_time_between_refreshes: Duration::from_millis(2000),
        }));
        let retry_queue = Arc::new(FailedPairsRetryQueue::new(FailedPairsRetryConfig {
            enabled: false,
            ..FailedPairsRetryConfig::default()
        }));
        retry_queue.track_failed_pair(&SourceName::Binance, &pair);

        let scheduler = RefetchScheduler::new(
            Arc::new(sources),
            registry,
            Arc::clone(&cache),
            Arc::clone(&retry_queue),
            RefetchConfig::default(),
            meta(),
        );
        scheduler.refresh_source_pairs(SourceName::Binance, vec![pair.clone()]).await;

        assert!(cache.get(&SourceName::Binance, &pair).is_some());
        assert!(retry_queue.get_retry_status().is_empty());
    }

    #[tokio::test]
    async fn refresh_source_pairs_enqueues_failure_to_retry_queue() {
        let registry = Arc::new(PairRegistry::new());
        let pair = Pair::new("XYZ", "USD").unwrap();
        let mut sources = SourcesManager::new();
        let (adapter, controller) =
            DynamicMockAdapter::new_with_controller(SourceName::Binance, SourceAdapterConfig::default());
        controller
            .set_quote_behavior(
                &pair,
                MockBehavior::Fail(EngineError::timeout(SourceName::Binance, pair.pair_key(), 1000)),
            )
            .await;
        sources.register(adapter);

        let cache = Arc::new(TtlCache::new(crate::cache::TtlPolicy {
            source_default: HashMap::from([(SourceName::Binance, Duration::from_secs(5))]),
            overrides: Vec::new(),
            stale_trigger_before_expiry: Duration::from_millis(1000),
            batch_interval: Duration::from_millis(300),
            min_time_between_refreshes: Duration::from_millis(2000),
        }));
        let retry_queue = Arc::new(FailedPairsRetryQueue::new(FailedPairsRetryConfig {
            enabled: false,
            ..FailedPairsRetryConfig::default()
        }));

        let scheduler = RefetchScheduler::new(
            Arc::new(sources),
            registry,
            cache,
            Arc::clone(&retry_queue),
            RefetchConfig::default(),
            meta(),
        );
        scheduler.refresh_source_pairs(SourceName::Binance, vec![pair.clone()]).await;

        assert_eq!(retry_queue.get_retry_status().len(), 1);
    }
}
