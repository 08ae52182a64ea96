//! TTL cache and staleness tracker (§4.F).
//!
//! Staleness uses a min-heap driven by one dedicated task rather than a
//! timer per key (§9: "on runtimes without first-class timers, use a
//! min-heap of `(fireAt, key)` polled by a dedicated goroutine"). Stale
//! items accrue in a pending buffer and are flushed as a single
//! `StaleBatch` at most once per `batch_interval`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use priceflow_core::{CacheMetadata, CachedQuote, Pair, Quote, SourceName, StaleBatch, StaleItem};
use priceflow_types::PairTtlOverride;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant as TokioInstant;

use crate::metrics;

type CacheKey = (SourceName, Pair);

struct CacheEntry {
    quote: Quote,
    metadata: CacheMetadata,
    /// Mirrors `metadata.last_refreshed_at`, but on the same monotonic clock
    /// the stale-timer loop runs on, so the min-refresh gate in
    /// `handle_stale_fire` stays correct under a paused/advanced Tokio clock
    /// in tests (where `SystemTime::now()` does not move in lockstep with
    /// `tokio::time::advance`).
    last_refreshed_mono: TokioInstant,
}

struct TimerEntry {
    fire_at: TokioInstant,
    key: CacheKey,
    version: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

/// Resolved TTL policy the cache was constructed with.
pub struct TtlPolicy {
    /// Per-source default TTL, from `SourceConfig::ttl_ms`.
    pub source_default: HashMap<SourceName, Duration>,
    /// Per-pair overrides, checked in configuration order; first match wins.
    pub overrides: Vec<PairTtlOverride>,
    /// How long before `expires_at` the stale timer fires.
    pub stale_trigger_before_expiry: Duration,
    /// Debounce window for stale-batch emission.
    pub batch_interval: Duration,
    /// Minimum time between two refreshes of the same entry.
    pub min_time_between_refreshes: Duration,
}

impl TtlPolicy {
    fn resolve_ttl(&self, source: &SourceName, pair: &Pair, explicit: Option<Duration>) -> Duration {
        if let Some(ttl) = explicit {
            return ttl;
        }
        for ov in &self.overrides {
            let pair_matches = ov.pair.0.eq_ignore_ascii_case(pair.base())
                && ov.pair.1.eq_ignore_ascii_case(pair.quote());
            let source_matches = ov
                .source
                .as_deref()
                .is_none_or(|s| s.eq_ignore_ascii_case(source.as_str()));
            if pair_matches && source_matches {
                return Duration::from_millis(ov.ttl_ms);
            }
        }
        self.source_default
            .get(source)
            .copied()
            .unwrap_or(Duration::from_secs(5))
    }
}

struct Shared {
    entries: DashMap<CacheKey, CacheEntry>,
    versions: DashMap<CacheKey, u64>,
    heap: SyncMutex<BinaryHeap<Reverse<TimerEntry>>>,
    pending: SyncMutex<Vec<StaleItem>>,
    notify: Notify,
    stale_tx: mpsc::UnboundedSender<StaleBatch>,
    policy: TtlPolicy,
}

impl Shared {
    fn cache_size_for(&self, source: &SourceName) -> usize {
        self.entries.iter().filter(|e| &e.key().0 == source).count()
    }

    fn schedule_stale_timer(&self, key: &CacheKey, ttl: Duration) {
        let delay = ttl.checked_sub(self.policy.stale_trigger_before_expiry);
        let Some(delay) = delay.filter(|d| !d.is_zero()) else {
            return;
        };
        let version = *self
            .versions
            .entry(key.clone())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        self.heap.lock().unwrap().push(Reverse(TimerEntry {
            fire_at: TokioInstant::now() + delay,
            key: key.clone(),
            version,
        }));
        self.notify.notify_one();
    }

    fn cancel_stale_timer(&self, key: &CacheKey) {
        self.versions.entry(key.clone()).and_modify(|v| *v += 1).or_insert(1);
    }

    fn fire_due_stale_timers(&self) {
        let now = TokioInstant::now();
        loop {
            let due = {
                let mut heap = self.heap.lock().unwrap();
                match heap.peek() {
                    Some(Reverse(t)) if t.fire_at <= now => heap.pop().map(|Reverse(t)| t),
                    _ => None,
                }
            };
            let Some(timer) = due else { break };
            self.handle_stale_fire(timer);
        }
    }

    fn handle_stale_fire(&self, timer: TimerEntry) {
        let still_current = self
            .versions
            .get(&timer.key)
            .is_some_and(|v| *v == timer.version);
        if !still_current {
            return;
        }
        let Some(entry) = self.entries.get(&timer.key) else {
            return;
        };
        let since_refresh = TokioInstant::now().saturating_duration_since(entry.last_refreshed_mono);
        if since_refresh < self.policy.min_time_between_refreshes {
            return;
        }
        let item = StaleItem {
            source: timer.key.0.clone(),
            pair: timer.key.1.clone(),
            expires_at: entry.metadata.expires_at,
        };
        drop(entry);
        self.pending.lock().unwrap().push(item);
    }

    fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    fn flush_stale_batch(&self) {
        let items = std::mem::take(&mut *self.pending.lock().unwrap());
        if items.is_empty() {
            return;
        }
        let _ = self.stale_tx.send(StaleBatch {
            items,
            batch_timestamp: SystemTime::now(),
        });
    }
}

async fn run_timer_loop(shared: Arc<Shared>, mut stop_rx: oneshot::Receiver<()>) {
    let mut batch_deadline: Option<TokioInstant> = None;
    loop {
        let next_stale = { shared.heap.lock().unwrap().peek().map(|Reverse(t)| t.fire_at) };
        let stale_sleep = tokio::time::sleep_until(next_stale.unwrap_or_else(far_future));
        let batch_sleep = tokio::time::sleep_until(batch_deadline.unwrap_or_else(far_future));
        tokio::select! {
            _ = &mut stop_rx => break,
            () = shared.notify.notified() => {}
            () = stale_sleep, if next_stale.is_some() => {
                shared.fire_due_stale_timers();
            }
            () = batch_sleep, if batch_deadline.is_some() => {
                shared.flush_stale_batch();
                batch_deadline = None;
            }
        }
        if batch_deadline.is_none() && shared.has_pending() {
            batch_deadline = Some(TokioInstant::now() + shared.policy.batch_interval);
        }
    }
}

fn far_future() -> TokioInstant {
    TokioInstant::now() + Duration::from_secs(365 * 24 * 3600)
}

/// Handle to the cache's background stale-timer task, torn down the same
/// way [`priceflow_core::StreamHandle`] tears down a streaming session.
struct TimerTask {
    join: Option<tokio::task::JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        priceflow_core::stream::drop_impl(&mut self.join, &mut self.stop_tx);
    }
}

/// Cache keyed by `(source, pair)`, with proactive staleness tracking.
pub struct TtlCache {
    shared: Arc<Shared>,
    _timer_task: TimerTask,
    stale_rx: SyncMutex<Option<mpsc::UnboundedReceiver<StaleBatch>>>,
}

impl TtlCache {
    /// Build a new cache and spawn its stale-timer driver task.
    ///
    /// Must be called from within a running Tokio runtime.
    #[must_use]
    pub fn new(policy: TtlPolicy) -> Self {
        let (stale_tx, stale_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            entries: DashMap::new(),
            versions: DashMap::new(),
            heap: SyncMutex::new(BinaryHeap::new()),
            pending: SyncMutex::new(Vec::new()),
            notify: Notify::new(),
            stale_tx,
            policy,
        });
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(run_timer_loop(Arc::clone(&shared), stop_rx));
        Self {
            shared,
            _timer_task: TimerTask {
                join: Some(join),
                stop_tx: Some(stop_tx),
            },
            stale_rx: SyncMutex::new(Some(stale_rx)),
        }
    }

    /// Take ownership of the stale-batch receiver. Only one subscriber is
    /// supported (the refetch scheduler); returns `None` if already taken.
    pub fn take_stale_batch_receiver(&self) -> Option<mpsc::UnboundedReceiver<StaleBatch>> {
        self.stale_rx.lock().unwrap().take()
    }

    /// Look up a cached quote. Returns `None` on miss or if the entry has
    /// expired (lazily evicted on read).
    #[must_use]
    pub fn get(&self, source: &SourceName, pair: &Pair) -> Option<CachedQuote> {
        let key = (source.clone(), pair.clone());
        let entry = self.shared.entries.get(&key)?;
        if SystemTime::now() >= entry.metadata.expires_at {
            drop(entry);
            self.del(source, pair);
            return None;
        }
        Some(CachedQuote {
            quote: entry.quote.clone(),
            source: source.clone(),
            cached_at: entry.metadata.cached_at,
        })
    }

    /// Insert or overwrite a cached quote, (re)arming its stale timer.
    pub fn set(&self, source: &SourceName, pair: &Pair, quote: Quote, ttl_override: Option<Duration>) {
        let key = (source.clone(), pair.clone());
        let ttl = self.shared.policy.resolve_ttl(source, pair, ttl_override);
        let now = SystemTime::now();
        let metadata = CacheMetadata {
            source: source.clone(),
            pair: pair.clone(),
            cached_at: now,
            expires_at: now + ttl,
            ttl,
            stale_trigger_before_expiry: self.shared.policy.stale_trigger_before_expiry,
            last_refreshed_at: now,
        };
        self.shared.entries.insert(
            key.clone(),
            CacheEntry { quote, metadata, last_refreshed_mono: TokioInstant::now() },
        );
        self.shared.schedule_stale_timer(&key, ttl);
        metrics::cache_size(source.as_str(), self.shared.cache_size_for(source));
    }

    /// Remove a single entry, cancelling its stale timer.
    pub fn del(&self, source: &SourceName, pair: &Pair) {
        let key = (source.clone(), pair.clone());
        self.shared.entries.remove(&key);
        self.shared.cancel_stale_timer(&key);
        metrics::cache_size(source.as_str(), self.shared.cache_size_for(source));
    }

    /// Remove every entry. Scheduled timers are invalidated lazily: they
    /// find their entry gone and skip.
    pub fn clear(&self) {
        let sources: std::collections::HashSet<SourceName> =
            self.shared.entries.iter().map(|e| e.key().0.clone()).collect();
        self.shared.entries.clear();
        for source in sources {
            metrics::cache_size(source.as_str(), 0);
        }
    }

    /// Snapshot of every entry's bookkeeping metadata, keyed by `(source, pair)`.
    #[must_use]
    pub fn get_metadata(&self) -> HashMap<(SourceName, Pair), CacheMetadata> {
        self.shared
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().metadata.clone()))
            .collect()
    }

    /// Reset `cached_at`/`expires_at`/`last_refreshed_at` without touching
    /// the stored quote, and reschedule the stale timer accordingly.
    pub fn update_refresh_time(&self, source: &SourceName, pair: &Pair) {
        let key = (source.clone(), pair.clone());
        let Some(mut entry) = self.shared.entries.get_mut(&key) else {
            return;
        };
        let now = SystemTime::now();
        let ttl = entry.metadata.ttl;
        entry.metadata.cached_at = now;
        entry.metadata.expires_at = now + ttl;
        entry.metadata.last_refreshed_at = now;
        entry.last_refreshed_mono = TokioInstant::now();
        drop(entry);
        self.shared.schedule_stale_timer(&key, ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use priceflow_core::Price;

    fn policy() -> TtlPolicy {
        TtlPolicy {
            source_default: HashMap::from([(SourceName::Binance, Duration::from_millis(5000))]),
            overrides: Vec::new(),
            stale_trigger_before_expiry: Duration::from_millis(1000),
            batch_interval: Duration::from_millis(300),
            min_time_between_refreshes: Duration::from_millis(2000),
        }
    }

    fn quote(pair: &Pair) -> Quote {
        Quote {
            pair: pair.clone(),
            price: Price::parse("67890.12").unwrap(),
            received_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn set_then_get_within_ttl_hits() {
        let cache = TtlCache::new(policy());
        let pair = Pair::new("BTC", "USDT").unwrap();
        cache.set(&SourceName::Binance, &pair, quote(&pair), None);
        let got = cache.get(&SourceName::Binance, &pair).unwrap();
        assert_eq!(got.quote.price.as_str(), "67890.12");
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let mut p = policy();
        p.source_default.insert(SourceName::Okx, Duration::from_millis(1));
        let cache = TtlCache::new(p);
        let pair = Pair::new("ETH", "USDT").unwrap();
        cache.set(&SourceName::Okx, &pair, quote(&pair), None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get(&SourceName::Okx, &pair).is_none());
    }

    #[tokio::test]
    async fn del_removes_entry() {
        let cache = TtlCache::new(policy());
        let pair = Pair::new("SOL", "USDT").unwrap();
        cache.set(&SourceName::Binance, &pair, quote(&pair), None);
        cache.del(&SourceName::Binance, &pair);
        assert!(cache.get(&SourceName::Binance, &pair).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timers_coalesce_into_one_batch() {
        let cache = TtlCache::new(policy());
        let mut rx = cache.take_stale_batch_receiver().unwrap();
        for sym in ["BTC", "ETH", "SOL", "XRP", "ADA"] {
            let pair = Pair::new(sym, "USDT").unwrap();
            cache.set(&SourceName::Binance, &pair, quote(&pair), None);
        }
        tokio::time::advance(Duration::from_millis(4100)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.items.len(), 5);
    }
}
