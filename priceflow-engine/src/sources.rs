//! Sources manager (§4.D): adapter registry, single-flight around
//! `fetch_quote`/`get_pairs`, and per-call metrics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use priceflow_core::{EngineError, Pair, Quote, SourceAdapter, SourceName};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::broadcast;

use crate::metrics;

type FetchQuoteKey = (SourceName, Pair);
type FetchResult = Result<Quote, EngineError>;
type GetPairsResult = Result<Vec<Pair>, EngineError>;

/// Registry of configured adapters, wrapping every externally-callable
/// operation with single-flight coalescing and metrics.
pub struct SourcesManager {
    adapters: HashMap<SourceName, Arc<dyn SourceAdapter>>,
    inflight_fetch: AsyncMutex<HashMap<FetchQuoteKey, broadcast::Sender<FetchResult>>>,
    inflight_get_pairs: AsyncMutex<HashMap<SourceName, broadcast::Sender<GetPairsResult>>>,
}

impl Default for SourcesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SourcesManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            inflight_fetch: AsyncMutex::new(HashMap::new()),
            inflight_get_pairs: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Register an adapter under its declared name.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    /// Look up a registered adapter by name.
    #[must_use]
    pub fn adapter(&self, source: &SourceName) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source).cloned()
    }

    /// All registered source names whose adapter is enabled and exposes a
    /// stream service, per §4.J step 1.
    #[must_use]
    pub fn streaming_sources(&self) -> Vec<(SourceName, Arc<dyn SourceAdapter>)> {
        self.adapters
            .iter()
            .filter(|(_, a)| a.get_config().enabled && a.stream_service().is_some())
            .map(|(name, a)| (name.clone(), a.clone()))
            .collect()
    }

    /// Whether `source`'s adapter declares batch-fetch support.
    #[must_use]
    pub fn is_fetch_quotes_supported(&self, source: &SourceName) -> bool {
        self.adapters
            .get(source)
            .is_some_and(|a| a.supports_batch())
    }

    fn resolve(&self, source: &SourceName) -> Result<Arc<dyn SourceAdapter>, EngineError> {
        let adapter = self
            .adapters
            .get(source)
            .ok_or_else(|| EngineError::SourceUnsupported {
                name: source.to_string(),
            })?;
        if !adapter.get_config().enabled {
            return Err(EngineError::SourceDisabled {
                name: source.to_string(),
            });
        }
        Ok(adapter.clone())
    }

    /// Fetch a single quote, coalescing concurrent callers for the same
    /// `(source, pair)` into one upstream call (§4.D, §9 single-flight note).
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn fetch_quote(&self, source: &SourceName, pair: &Pair) -> FetchResult {
        let key = (source.clone(), pair.clone());

        let mut joined = {
            let mut inflight = self.inflight_fetch.lock().await;
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
                Err(EngineError::price_not_found(
                    pair.pair_key(),
                    source.clone(),
                ))
            });
        }

        let result = self.do_fetch_quote(source, pair).await;

        let tx = self.inflight_fetch.lock().await.remove(&key);
        if let Some(tx) = tx {
            let _ = tx.send(result.clone());
        }

        result
    }

    async fn do_fetch_quote(&self, source: &SourceName, pair: &Pair) -> FetchResult {
        let adapter = self.resolve(source)?;
        let started = Instant::now();
        let result = adapter.fetch_quote(pair).await;
        let elapsed = started.elapsed();
        metrics::source_fetch_duration(source.as_str(), elapsed);
        self.record_outcome(source, &result, 1);
        result
    }

    /// Fetch a batch of quotes through the adapter, only valid when
    /// `is_fetch_quotes_supported` is true.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, pairs)))]
    pub async fn fetch_quotes(
        &self,
        source: &SourceName,
        pairs: &[Pair],
    ) -> Result<Vec<Quote>, EngineError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let adapter = self.resolve(source)?;
        let started = Instant::now();
        let result = adapter.fetch_quotes(pairs).await;
        metrics::source_fetch_duration(source.as_str(), started.elapsed());
        match &result {
            Ok(quotes) => metrics::quotes_processed(source.as_str(), "success", quotes.len() as u64),
            Err(e) => {
                self.record_error_metrics(source, e);
                metrics::quotes_processed(source.as_str(), "error", 1);
            }
        }
        result
    }

    /// Enumerate a source's full pair universe, single-flighted by source.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn get_pairs(&self, source: &SourceName) -> Result<Vec<Pair>, EngineError> {
        let mut joined = {
            let mut inflight = self.inflight_get_pairs.lock().await;
            if let Some(tx) = inflight.get(source) {
                Some(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(source.clone(), tx);
                None
            }
        };

        if let Some(ref mut rx) = joined {
            return rx.recv().await.unwrap_or_else(|_| {
                Err(EngineError::SourceUnsupported {
                    name: source.to_string(),
                })
            });
        }

        let result = self.resolve(source).map(|a| a.get_pairs());

        let tx = self.inflight_get_pairs.lock().await.remove(source);
        if let Some(tx) = tx {
            let _ = tx.send(result.clone());
        }

        result
    }

    fn record_outcome(&self, source: &SourceName, result: &FetchResult, batch_len: u64) {
        match result {
            Ok(_) => metrics::quotes_processed(source.as_str(), "success", batch_len),
            Err(e) => {
                self.record_error_metrics(source, e);
                metrics::quotes_processed(source.as_str(), "error", 1);
            }
        }
    }

    fn record_error_metrics(&self, source: &SourceName, error: &EngineError) {
        if matches!(error, EngineError::RateLimited { .. }) {
            metrics::rate_limit_hit(source.as_str());
        }
        if let EngineError::SourceApi { status, .. } = error {
            metrics::source_api_error(
                source.as_str(),
                status.unwrap_or(0),
                "source_api",
            );
        }
    }
}
