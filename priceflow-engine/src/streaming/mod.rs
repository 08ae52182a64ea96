//! Streaming coordinator (§4.J): subscribes/unsubscribes adapters' stream
//! services as pair registrations come and go, reference-counted per
//! `(source, pair)`.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use priceflow_core::{Pair, SourceName};
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::TtlCache;
use crate::metrics;
use crate::registry::{PairRegistry, RegistryEvent};
use crate::sources::SourcesManager;

type SubKey = (SourceName, Pair);

struct SubscriptionState {
    refcount: HashMap<SubKey, u32>,
    connected_sources: std::collections::HashSet<SourceName>,
}

/// Drives every streaming-capable adapter's subscribe/unsubscribe lifecycle
/// in lockstep with the pair registry.
pub struct StreamingCoordinator {
    sources: Arc<SourcesManager>,
    registry: Arc<PairRegistry>,
    cache: Arc<TtlCache>,
    state: AsyncMutex<SubscriptionState>,
}

impl StreamingCoordinator {
    /// Wire up the coordinator. Call [`start`](Self::start) to connect to
    /// every already-registered pair and begin reacting to registry events.
    #[must_use]
    pub fn new(sources: Arc<SourcesManager>, registry: Arc<PairRegistry>, cache: Arc<TtlCache>) -> Arc<Self> {
        Arc::new(Self {
            sources,
            registry,
            cache,
            state: AsyncMutex::new(SubscriptionState {
                refcount: HashMap::new(),
                connected_sources: std::collections::HashSet::new(),
            }),
        })
    }

    /// Subscribe every currently-registered pair on every streaming-capable,
    /// enabled source, then begin reacting to `pair-added`/`pair-removed`.
    pub async fn start(self: &Arc<Self>) {
        for (source, _adapter) in self.sources.streaming_sources() {
            for pair in self.registry.get_pairs_by_source(&source) {
                self.subscribe_pair(&source, &pair).await;
            }
        }

        let mut events = self.registry.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::PairAdded(source, pair)) => this.subscribe_pair(&source, &pair).await,
                    Ok(RegistryEvent::PairRemoved(source, pair)) => this.unsubscribe_pair(&source, &pair).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Subscribe `(source, pair)`, reference-counting repeat calls into a
    /// single upstream subscription.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn subscribe_pair(&self, source: &SourceName, pair: &Pair) {
        let Some(adapter) = self.sources.adapter(source) else {
            return;
        };
        let Some(stream_service) = adapter.stream_service() else {
            return;
        };

        let mut state = self.state.lock().await;
        let key = (source.clone(), pair.clone());
        let count = state.refcount.entry(key).or_insert(0);
        *count += 1;
        if *count > 1 {
            return;
        }

        if !state.connected_sources.contains(source) && stream_service.connect().await.is_ok() {
            state.connected_sources.insert(source.clone());
        }
        drop(state);

        let cache = Arc::clone(&self.cache);
        let registry = Arc::clone(&self.registry);
        let source_for_quote = source.clone();
        let source_for_error = source.clone();

        let on_quote = Box::new(move |quote: priceflow_core::Quote| {
            let source = source_for_quote.clone();
            cache.set(&source, &quote.pair, quote.clone(), None);
            registry.track_successful_fetch(&source, &quote.pair);
            metrics::quotes_processed(source.as_str(), "success", 1);
            metrics::websocket_message_received(source.as_str());
        });
        let on_error = Box::new(move |error: priceflow_core::EngineError| {
            metrics::websocket_error(source_for_error.as_str(), &error.to_string());
        });

        let _ = stream_service.subscribe(pair, on_quote, on_error).await;
    }

    /// Unsubscribe `(source, pair)`: only the last outstanding subscriber
    /// actually tears down the upstream subscription.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn unsubscribe_pair(&self, source: &SourceName, pair: &Pair) {
        let Some(adapter) = self.sources.adapter(source) else {
            return;
        };
        let Some(stream_service) = adapter.stream_service() else {
            return;
        };

        let mut state = self.state.lock().await;
        let key = (source.clone(), pair.clone());
        let should_unsubscribe = match state.refcount.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                state.refcount.remove(&key);
                true
            }
            None => false,
        };
        drop(state);

        if should_unsubscribe {
            let _ = stream_service.unsubscribe(pair).await;
        }
    }

    /// Unsubscribe everything and disconnect every connected source,
    /// swallowing per-source teardown errors for a graceful shutdown.
    pub async fn shutdown(&self) {
        let keys: Vec<SubKey> = {
            let state = self.state.lock().await;
            state.refcount.keys().cloned().collect()
        };
        for (source, pair) in &keys {
            if let Some(adapter) = self.sources.adapter(source)
                && let Some(stream_service) = adapter.stream_service()
            {
                let _ = stream_service.unsubscribe(pair).await;
            }
        }
        let sources: Vec<SourceName> = {
            let state = self.state.lock().await;
            state.connected_sources.iter().cloned().collect()
        };
        for source in sources {
            if let Some(adapter) = self.sources.adapter(&source)
                && let Some(stream_service) = adapter.stream_service()
            {
                stream_service.disconnect().await;
            }
        }
    }
}
