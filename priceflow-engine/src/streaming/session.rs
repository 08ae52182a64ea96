//! `BaseStreamService` composition helper (§4.J, §9): "inheritance of
//! `BaseStreamService` becomes composition" — a reusable identifier/pair
//! bookkeeping struct every streaming adapter embeds, with adapter-specific
//! wire encoding/decoding injected by the adapter itself.

use std::collections::HashMap;
use std::sync::Mutex;

use priceflow_core::{EngineError, Pair, Quote};

type QuoteHandler = Box<dyn Fn(Quote) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(EngineError) + Send + Sync>;

struct Handlers {
    on_quote: QuoteHandler,
    on_error: ErrorHandler,
}

struct Inner {
    identifier_to_pair: HashMap<String, Pair>,
    pair_to_identifier: HashMap<Pair, String>,
    handlers: HashMap<String, Handlers>,
}

/// Subscription bookkeeping shared by every streaming adapter: which wire
/// identifier maps to which pair, and the handlers registered for it.
///
/// Adapters own one of these and drive it from their WebSocket read loop;
/// the adapter itself supplies the wire-format encode/decode, this struct
/// supplies the identifier<->pair lifecycle every provider needs identically.
pub struct StreamSessionState {
    inner: Mutex<Inner>,
}

impl Default for StreamSessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSessionState {
    /// Create empty subscription state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                identifier_to_pair: HashMap::new(),
                pair_to_identifier: HashMap::new(),
                handlers: HashMap::new(),
            }),
        }
    }

    /// Register `pair` under its wire `identifier` with the handlers to
    /// invoke for it.
    pub fn register(
        &self,
        identifier: impl Into<String>,
        pair: &Pair,
        on_quote: impl Fn(Quote) + Send + Sync + 'static,
        on_error: impl Fn(EngineError) + Send + Sync + 'static,
    ) {
        let identifier = identifier.into();
        let mut inner = self.inner.lock().unwrap();
        inner.identifier_to_pair.insert(identifier.clone(), pair.clone());
        inner.pair_to_identifier.insert(pair.clone(), identifier.clone());
        inner.handlers.insert(
            identifier,
            Handlers {
                on_quote: Box::new(on_quote),
                on_error: Box::new(on_error),
            },
        );
    }

    /// Remove `pair`'s subscription entirely.
    pub fn unregister(&self, pair: &Pair) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(identifier) = inner.pair_to_identifier.remove(pair) {
            inner.identifier_to_pair.remove(&identifier);
            inner.handlers.remove(&identifier);
        }
    }

    /// The complete set of currently-tracked wire identifiers, for
    /// resubscribing after a reconnect.
    #[must_use]
    pub fn tracked_identifiers(&self) -> Vec<String> {
        self.inner.lock().unwrap().identifier_to_pair.keys().cloned().collect()
    }

    /// Deliver a quote for `identifier` to every handler registered for it.
    /// No-op if the identifier isn't currently tracked (e.g. a race with
    /// `unregister`).
    pub fn emit_quote(&self, identifier: &str, price: priceflow_core::Price, received_at: std::time::SystemTime) {
        let (pair, callback_invoked) = {
            let inner = self.inner.lock().unwrap();
            let Some(pair) = inner.identifier_to_pair.get(identifier).cloned() else {
                return;
            };
            if let Some(handlers) = inner.handlers.get(identifier) {
                (handlers.on_quote)(Quote {
                    pair: pair.clone(),
                    price,
                    received_at,
                });
                (pair, true)
            } else {
                (pair, false)
            }
        };
        let _ = (pair, callback_invoked);
    }

    /// Deliver a terminal error for `identifier`, if still tracked.
    pub fn emit_error(&self, identifier: &str, error: EngineError) {
        let inner = self.inner.lock().unwrap();
        if let Some(handlers) = inner.handlers.get(identifier) {
            (handlers.on_error)(error);
        }
    }

    /// Clear all subscription state, e.g. before a full resubscribe.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.identifier_to_pair.clear();
        inner.pair_to_identifier.clear();
        inner.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn emit_quote_routes_to_registered_handler() {
        let state = StreamSessionState::new();
        let pair = Pair::new("BTC", "USDT").unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);
        state.register(
            "btcusdt",
            &pair,
            move |_q| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            },
            |_e| {},
        );
        state.emit_quote("btcusdt", priceflow_core::Price::parse("100").unwrap(), std::time::SystemTime::now());
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_stops_delivery_and_resubscribe_snapshot_reflects_it() {
        let state = StreamSessionState::new();
        let pair = Pair::new("ETH", "USDT").unwrap();
        state.register("ethusdt", &pair, |_q| {}, |_e| {});
        assert_eq!(state.tracked_identifiers(), vec!["ethusdt".to_string()]);
        state.unregister(&pair);
        assert!(state.tracked_identifiers().is_empty());
    }
}
