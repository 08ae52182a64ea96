//! A fully controllable mock [`SourceAdapter`] for integration tests.
//!
//! Behavior for quotes, batches, and streaming is driven entirely by an
//! external [`DynamicMockController`] rather than hard-coded fixtures, so
//! tests can script exact failure and timing scenarios.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use priceflow_core::{EngineError, Pair, Quote, SourceAdapter, SourceAdapterConfig, SourceName, StreamService};
use tokio::sync::Mutex;

/// Instruction for how a single-pair call should behave.
#[derive(Clone)]
pub enum MockBehavior<T> {
    /// Return the provided value immediately.
    Return(T),
    /// Fail immediately with the provided error.
    Fail(EngineError),
    /// Hang indefinitely (simulate a stalled upstream).
    Hang,
}

/// Instruction for how the adapter's stream service should behave.
#[derive(Clone)]
pub enum StreamBehavior {
    /// No streaming support configured; `stream_service()` still returns
    /// `Some`, but every `subscribe` fails as unsupported.
    Unset,
    /// Deliver these quotes (filtered to the subscribed pair) then hold the
    /// subscription open until unsubscribed.
    Success(Vec<Quote>),
    /// Fail every `subscribe` call immediately.
    Fail(EngineError),
    /// Hang every `subscribe` call (simulate a stalled connect).
    Hang,
    /// Accept externally-pushed quotes via [`DynamicMockController::push_quote`].
    Manual,
}

struct Subscription {
    on_quote: Box<dyn Fn(Quote) + Send + Sync>,
    #[allow(dead_code)]
    on_error: Box<dyn Fn(EngineError) + Send + Sync>,
    task: Option<priceflow_core::StreamHandle>,
}

#[derive(Default)]
struct InternalState {
    quote_rules: HashMap<String, MockBehavior<Quote>>,
    batch_rule: Option<MockBehavior<Vec<Quote>>>,
    stream_behavior: Option<StreamBehavior>,
    subscriptions: HashMap<String, Subscription>,
    subscribe_log: Vec<Pair>,
}

fn pair_key(pair: &Pair) -> String {
    format!("{}/{}", pair.base().to_lowercase(), pair.quote().to_lowercase())
}

/// Controller handle used by tests to drive a [`DynamicMockAdapter`].
pub struct DynamicMockController {
    state: Arc<Mutex<InternalState>>,
    supports_batch: Arc<AtomicBool>,
}

impl DynamicMockController {
    /// Set the behavior for `fetch_quote` calls for a specific pair.
    pub async fn set_quote_behavior(&self, pair: &Pair, behavior: MockBehavior<Quote>) {
        let mut guard = self.state.lock().await;
        guard.quote_rules.insert(pair_key(pair), behavior);
    }

    /// Set the behavior for `fetch_quotes` (batch) calls.
    pub async fn set_batch_behavior(&self, behavior: MockBehavior<Vec<Quote>>) {
        let mut guard = self.state.lock().await;
        guard.batch_rule = Some(behavior);
    }

    /// Enable or disable `supports_batch()`.
    pub fn set_supports_batch(&self, supported: bool) {
        self.supports_batch.store(supported, Ordering::SeqCst);
    }

    /// Set the adapter's stream behavior.
    pub async fn set_stream_behavior(&self, behavior: StreamBehavior) {
        let mut guard = self.state.lock().await;
        guard.stream_behavior = Some(behavior);
    }

    /// Push a quote into an active `Manual`-mode subscription for `pair`.
    ///
    /// Returns `true` if a subscription was found and the quote delivered.
    pub async fn push_quote(&self, pair: &Pair, quote: Quote) -> bool {
        let guard = self.state.lock().await;
        guard.subscriptions.get(&pair_key(pair)).is_some_and(|sub| {
            (sub.on_quote)(quote);
            true
        })
    }

    /// Simulate an upstream failure for every currently-subscribed pair,
    /// tearing down their subscriptions.
    pub async fn fail_stream(&self, error: EngineError) {
        let mut guard = self.state.lock().await;
        let subs = std::mem::take(&mut guard.subscriptions);
        for (_, sub) in subs {
            (sub.on_error)(error.clone());
        }
    }

    /// Return a copy of the pairs subscribed so far, in subscribe order.
    pub async fn get_subscribe_log(&self) -> Vec<Pair> {
        self.state.lock().await.subscribe_log.clone()
    }

    /// Return the currently-active subscription pairs.
    pub async fn get_active_subscriptions(&self) -> Vec<String> {
        self.state.lock().await.subscriptions.keys().cloned().collect()
    }

    /// Clear all configured behaviors, logs, and active subscriptions.
    pub async fn clear_all_behaviors(&self) {
        let mut guard = self.state.lock().await;
        guard.quote_rules.clear();
        guard.batch_rule = None;
        guard.stream_behavior = None;
        guard.subscriptions.clear();
        guard.subscribe_log.clear();
    }
}

/// A [`SourceAdapter`] whose every method defers to externally-configured
/// behavior, for deterministic integration tests.
pub struct DynamicMockAdapter {
    name: SourceName,
    config: SourceAdapterConfig,
    state: Arc<Mutex<InternalState>>,
    supports_batch: Arc<AtomicBool>,
}

impl DynamicMockAdapter {
    /// Create a new dynamic mock adapter and its controller.
    ///
    /// Batching is enabled by default; call
    /// [`DynamicMockController::set_supports_batch`] to disable it.
    #[must_use]
    pub fn new_with_controller(
        name: SourceName,
        config: SourceAdapterConfig,
    ) -> (Arc<dyn SourceAdapter>, DynamicMockController) {
        let state = Arc::new(Mutex::new(InternalState::default()));
        let supports_batch = Arc::new(AtomicBool::new(true));
        let controller = DynamicMockController {
            state: Arc::clone(&state),
            supports_batch: Arc::clone(&supports_batch),
        };
        let adapter = Arc::new(Self {
            name,
            config,
            state,
            supports_batch,
        });
        (adapter as Arc<dyn SourceAdapter>, controller)
    }
}

#[async_trait]
impl SourceAdapter for DynamicMockAdapter {
    fn name(&self) -> SourceName {
        self.name.clone()
    }

    fn get_config(&self) -> SourceAdapterConfig {
        self.config.clone()
    }

    async fn fetch_quote(&self, pair: &Pair) -> Result<Quote, EngineError> {
        let behavior = {
            let guard = self.state.lock().await;
            guard.quote_rules.get(&pair_key(pair)).cloned()
        };
        match behavior {
            Some(MockBehavior::Return(q)) => Ok(q),
            Some(MockBehavior::Fail(e)) => Err(e),
            Some(MockBehavior::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Err(EngineError::price_not_found(pair.pair_key(), self.name.clone())),
        }
    }

    fn supports_batch(&self) -> bool {
        self.supports_batch.load(Ordering::SeqCst)
    }

    async fn fetch_quotes(&self, pairs: &[Pair]) -> Result<Vec<Quote>, EngineError> {
        if let Some(max) = self.config.max_batch_size
            && pairs.len() > max
        {
            return Err(EngineError::BatchSizeExceeded {
                requested: pairs.len(),
                max,
                source: self.name.clone(),
            });
        }
        let behavior = {
            let guard = self.state.lock().await;
            guard.batch_rule.clone()
        };
        match behavior {
            Some(MockBehavior::Return(qs)) => Ok(qs),
            Some(MockBehavior::Fail(e)) => Err(e),
            Some(MockBehavior::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Err(EngineError::SourceUnsupported {
                name: self.name.to_string(),
            }),
        }
    }

    fn stream_service(&self) -> Option<&dyn StreamService> {
        Some(self)
    }
}

#[async_trait]
impl StreamService for DynamicMockAdapter {
    async fn connect(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn disconnect(&self) {
        let mut guard = self.state.lock().await;
        for (_, sub) in std::mem::take(&mut guard.subscriptions) {
            if let Some(task) = sub.task {
                task.abort();
            }
        }
    }

    async fn subscribe(
        &self,
        pair: &Pair,
        on_quote: Box<dyn Fn(Quote) + Send + Sync>,
        on_error: Box<dyn Fn(EngineError) + Send + Sync>,
    ) -> Result<(), EngineError> {
        {
            let mut guard = self.state.lock().await;
            guard.subscribe_log.push(pair.clone());
        }

        let behavior = {
            let guard = self.state.lock().await;
            guard.stream_behavior.clone().unwrap_or(StreamBehavior::Unset)
        };

        match behavior {
            StreamBehavior::Unset => Err(EngineError::SourceUnsupported {
                name: self.name.to_string(),
            }),
            StreamBehavior::Fail(e) => Err(e),
            StreamBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            StreamBehavior::Manual => {
                let mut guard = self.state.lock().await;
                guard.subscriptions.insert(
                    pair_key(pair),
                    Subscription {
                        on_quote,
                        on_error,
                        task: None,
                    },
                );
                Ok(())
            }
            StreamBehavior::Success(quotes) => {
                let matching: Vec<Quote> = quotes
                    .into_iter()
                    .filter(|q| pair_key(&q.pair) == pair_key(pair))
                    .collect();
                // Deliver scripted quotes inline; this mock has no network
                // latency to simulate.
                for q in matching {
                    (on_quote)(q);
                }
                let mut guard = self.state.lock().await;
                guard.subscriptions.insert(
                    pair_key(pair),
                    Subscription {
                        on_quote,
                        on_error,
                        task: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn unsubscribe(&self, pair: &Pair) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        if let Some(sub) = guard.subscriptions.remove(&pair_key(pair))
            && let Some(task) = sub.task
        {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn sample_quote(pair: &Pair) -> Quote {
        Quote {
            pair: pair.clone(),
            price: priceflow_core::Price::parse("100.0").unwrap(),
            received_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn returns_configured_quote() {
        let pair = Pair::new("BTC", "USDT").unwrap();
        let (adapter, controller) = DynamicMockAdapter::new_with_controller(
            SourceName::Binance,
            SourceAdapterConfig::default(),
        );
        controller
            .set_quote_behavior(&pair, MockBehavior::Return(sample_quote(&pair)))
            .await;
        let got = adapter.fetch_quote(&pair).await.unwrap();
        assert_eq!(got.pair, pair);
    }

    #[tokio::test]
    async fn unconfigured_pair_is_price_not_found() {
        let pair = Pair::new("ETH", "USDT").unwrap();
        let (adapter, _controller) = DynamicMockAdapter::new_with_controller(
            SourceName::Okx,
            SourceAdapterConfig::default(),
        );
        let err = adapter.fetch_quote(&pair).await.unwrap_err();
        assert!(matches!(err, EngineError::PriceNotFound { .. }));
    }

    #[tokio::test]
    async fn manual_stream_delivers_pushed_quotes() {
        let pair = Pair::new("BTC", "USDT").unwrap();
        let (adapter, controller) = DynamicMockAdapter::new_with_controller(
            SourceName::Binance,
            SourceAdapterConfig::default(),
        );
        controller.set_stream_behavior(StreamBehavior::Manual).await;
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);

        let svc = adapter.stream_service().unwrap();
        svc.subscribe(
            &pair,
            Box::new(move |_q| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(|_e| {}),
        )
        .await
        .unwrap();

        assert!(controller.push_quote(&pair, sample_quote(&pair)).await);
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
