//! Pair registry (§4.E): which pairs each source is expected to serve, with
//! activity timestamps, and two indices kept in lock-step with the map.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::SystemTime;

use priceflow_core::{Pair, PairRegistration, SourceName};
use tokio::sync::broadcast;

use crate::metrics;

/// Emitted when a `(pair, source)` registration is created or removed.
///
/// The streaming coordinator (J) subscribes to these to drive
/// subscribe/unsubscribe lifecycle.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A pair was registered for a source for the first time.
    PairAdded(SourceName, Pair),
    /// A pair's registration for a source was removed.
    PairRemoved(SourceName, Pair),
}

struct Inner {
    registrations: HashMap<(SourceName, Pair), PairRegistration>,
    by_source: HashMap<SourceName, HashSet<Pair>>,
    by_pair: HashMap<Pair, HashSet<SourceName>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            registrations: HashMap::new(),
            by_source: HashMap::new(),
            by_pair: HashMap::new(),
        }
    }
}

/// Tracks which `(pair, source)` combinations the engine is actively
/// serving, along with request/fetch/response timestamps.
pub struct PairRegistry {
    inner: RwLock<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for PairRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PairRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner::new()),
            events,
        }
    }

    /// Subscribe to `pair-added`/`pair-removed` events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Record that a client requested `(pair, source)`, creating the
    /// registration if this is the first time it's been seen.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub fn track_quote_request(&self, source: &SourceName, pair: &Pair) {
        let now = SystemTime::now();
        let mut guard = self.inner.write().unwrap();
        let key = (source.clone(), pair.clone());
        let is_new = !guard.registrations.contains_key(&key);
        if is_new {
            guard.registrations.insert(
                key.clone(),
                PairRegistration {
                    pair: pair.clone(),
                    source: source.clone(),
                    registered_at: now,
                    last_fetch_at: std::time::UNIX_EPOCH,
                    last_response_at: std::time::UNIX_EPOCH,
                    last_request_at: now,
                },
            );
            guard
                .by_source
                .entry(source.clone())
                .or_default()
                .insert(pair.clone());
            guard
                .by_pair
                .entry(pair.clone())
                .or_default()
                .insert(source.clone());
        } else if let Some(reg) = guard.registrations.get_mut(&key) {
            reg.last_request_at = now;
        }
        drop(guard);
        metrics::registered_pair(source.as_str(), &pair.pair_key(), true);
        if is_new {
            let _ = self
                .events
                .send(RegistryEvent::PairAdded(source.clone(), pair.clone()));
        }
    }

    /// Record that an upstream fetch for `(pair, source)` succeeded.
    ///
    /// Safe no-op if the registration does not exist.
    pub fn track_successful_fetch(&self, source: &SourceName, pair: &Pair) {
        let mut guard = self.inner.write().unwrap();
        if let Some(reg) = guard.registrations.get_mut(&(source.clone(), pair.clone())) {
            reg.last_fetch_at = SystemTime::now();
        }
    }

    /// Record that an upstream response (success or failure) was observed.
    ///
    /// Safe no-op if the registration does not exist.
    pub fn track_response(&self, source: &SourceName, pair: &Pair) {
        let mut guard = self.inner.write().unwrap();
        if let Some(reg) = guard.registrations.get_mut(&(source.clone(), pair.clone())) {
            reg.last_response_at = SystemTime::now();
        }
    }

    /// All pairs currently registered for `source`.
    #[must_use]
    pub fn get_pairs_by_source(&self, source: &SourceName) -> Vec<Pair> {
        self.inner
            .read()
            .unwrap()
            .by_source
            .get(source)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pairs registered for `source`, paired with their `last_fetch_at`.
    #[must_use]
    pub fn get_pairs_by_source_with_timestamps(
        &self,
        source: &SourceName,
    ) -> Vec<(Pair, SystemTime)> {
        let guard = self.inner.read().unwrap();
        guard
            .by_source
            .get(source)
            .into_iter()
            .flatten()
            .filter_map(|pair| {
                guard
                    .registrations
                    .get(&(source.clone(), pair.clone()))
                    .map(|reg| (pair.clone(), reg.last_fetch_at))
            })
            .collect()
    }

    /// All sources currently registered to serve `pair`.
    #[must_use]
    pub fn get_sources_by_pair(&self, pair: &Pair) -> Vec<SourceName> {
        self.inner
            .read()
            .unwrap()
            .by_pair
            .get(pair)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every registration currently tracked.
    #[must_use]
    pub fn get_all_registrations(&self) -> Vec<PairRegistration> {
        self.inner
            .read()
            .unwrap()
            .registrations
            .values()
            .cloned()
            .collect()
    }

    /// Remove a `(pair, source)` registration, e.g. after `PriceNotFound` or
    /// `Unauthorized`. Updates both reverse indices atomically.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub fn remove_pair_source(&self, source: &SourceName, pair: &Pair) {
        let mut guard = self.inner.write().unwrap();
        let key = (source.clone(), pair.clone());
        let removed = guard.registrations.remove(&key).is_some();
        if !removed {
            return;
        }
        if let Some(set) = guard.by_source.get_mut(source) {
            set.remove(pair);
            if set.is_empty() {
                guard.by_source.remove(source);
            }
        }
        if let Some(set) = guard.by_pair.get_mut(pair) {
            set.remove(source);
            if set.is_empty() {
                guard.by_pair.remove(pair);
            }
        }
        drop(guard);
        metrics::registered_pair(source.as_str(), &pair.pair_key(), false);
        let _ = self
            .events
            .send(RegistryEvent::PairRemoved(source.clone(), pair.clone()));
    }

    /// Remove every registration whose `last_request_at` is older than
    /// `inactive_timeout`. Returns the count removed.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub fn cleanup_inactive_pairs(&self, inactive_timeout: std::time::Duration) -> usize {
        let now = SystemTime::now();
        let stale: Vec<(SourceName, Pair)> = {
            let guard = self.inner.read().unwrap();
            guard
                .registrations
                .values()
                .filter(|reg| {
                    now.duration_since(reg.last_request_at)
                        .is_ok_and(|age| age > inactive_timeout)
                })
                .map(|reg| (reg.source.clone(), reg.pair.clone()))
                .collect()
        };
        for (source, pair) in &stale {
            self.remove_pair_source(source, pair);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(base: &str, quote: &str) -> Pair {
        Pair::new(base, quote).unwrap()
    }

    #[test]
    fn track_quote_request_creates_registration_once() {
        let registry = PairRegistry::new();
        let mut events = registry.subscribe();
        registry.track_quote_request(&SourceName::Binance, &pair("BTC", "USDT"));
        registry.track_quote_request(&SourceName::Binance, &pair("BTC", "USDT"));
        assert_eq!(
            registry
                .get_pairs_by_source(&SourceName::Binance)
                .len(),
            1
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::PairAdded(..)
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn remove_pair_source_keeps_indices_in_lock_step() {
        let registry = PairRegistry::new();
        let p = pair("ETH", "USDT");
        registry.track_quote_request(&SourceName::Okx, &p);
        registry.remove_pair_source(&SourceName::Okx, &p);
        assert!(registry.get_pairs_by_source(&SourceName::Okx).is_empty());
        assert!(registry.get_sources_by_pair(&p).is_empty());
        assert!(registry.get_all_registrations().is_empty());
    }

    #[test]
    fn cleanup_inactive_pairs_removes_old_registrations() {
        let registry = PairRegistry::new();
        let p = pair("BTC", "USDT");
        registry.track_quote_request(&SourceName::Binance, &p);
        let removed = registry.cleanup_inactive_pairs(std::time::Duration::from_secs(0));
        assert_eq!(removed, 1);
        assert!(registry.get_all_registrations().is_empty());
    }
}
