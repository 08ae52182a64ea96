//! Failed-pair retry queue (§4.K): bounded-attempt retry bookkeeping with a
//! periodic due-scan that fires a registered callback.

use std::sync::{Arc, Mutex as SyncMutex};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use priceflow_core::{Pair, RetryMetadata, SourceName};
use priceflow_types::FailedPairsRetryConfig;
use tokio::sync::oneshot;

use crate::metrics;

type RetryKey = (SourceName, Pair);
type RetryCallback = dyn Fn(Vec<(SourceName, Pair)>) + Send + Sync;

struct Shared {
    entries: DashMap<RetryKey, RetryMetadata>,
    callback: SyncMutex<Option<Arc<RetryCallback>>>,
    config: FailedPairsRetryConfig,
}

impl Shared {
    fn publish_count(&self) {
        metrics::failed_pairs_count(self.entries.len());
    }
}

/// Tracks pairs that failed a refresh attempt, retrying on a fixed delay up
/// to a bounded number of attempts.
pub struct FailedPairsRetryQueue {
    shared: Arc<Shared>,
    _scan_task: ScanTask,
}

struct ScanTask {
    join: Option<tokio::task::JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Drop for ScanTask {
    fn drop(&mut self) {
        priceflow_core::stream::drop_impl(&mut self.join, &mut self.stop_tx);
    }
}

impl FailedPairsRetryQueue {
    /// Build the queue and spawn its periodic scan task, if enabled.
    #[must_use]
    pub fn new(config: FailedPairsRetryConfig) -> Self {
        let shared = Arc::new(Shared {
            entries: DashMap::new(),
            callback: SyncMutex::new(None),
            config,
        });
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = if shared.config.enabled {
            Some(tokio::spawn(run_scan_loop(Arc::clone(&shared), stop_rx)))
        } else {
            drop(stop_rx);
            None
        };
        Self {
            shared,
            _scan_task: ScanTask { join, stop_tx: Some(stop_tx) },
        }
    }

    /// Register the callback invoked with every pair whose `next_retry_at`
    /// has elapsed. Only one callback is supported; the latest registration
    /// wins.
    pub fn register_retry_callback<F>(&self, cb: F)
    where
        F: Fn(Vec<(SourceName, Pair)>) + Send + Sync + 'static,
    {
        *self.shared.callback.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Record a failed refresh for `(source, pair)`: new entries start at
    /// attempt 1; known ones increment, dropping out once `attempt` exceeds
    /// `max_attempts`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub fn track_failed_pair(&self, source: &SourceName, pair: &Pair) {
        let key = (source.clone(), pair.clone());
        let now = SystemTime::now();
        let delay = Duration::from_millis(self.shared.config.retry_delay_ms);
        let exceeded = {
            match self.shared.entries.get_mut(&key) {
                Some(mut meta) => {
                    meta.attempt += 1;
                    meta.last_attempt_at = now;
                    meta.next_retry_at = now + delay;
                    meta.attempt > self.shared.config.max_attempts
                }
                None => {
                    self.shared.entries.insert(
                        key.clone(),
                        RetryMetadata {
                            source: source.clone(),
                            pair: pair.clone(),
                            attempt: 1,
                            first_failed_at: now,
                            last_attempt_at: now,
                            next_retry_at: now + delay,
                        },
                    );
                    false
                }
            }
        };
        metrics::failed_pairs_retry_attempt(source.as_str(), &pair.pair_key());
        if exceeded {
            self.shared.entries.remove(&key);
            metrics::failed_pairs_max_attempts_reached(source.as_str(), &pair.pair_key());
        }
        self.shared.publish_count();
    }

    /// Remove `(source, pair)` from the queue, e.g. after a successful retry.
    pub fn remove_from_retry_queue(&self, source: &SourceName, pair: &Pair) {
        self.shared.entries.remove(&(source.clone(), pair.clone()));
        self.shared.publish_count();
    }

    /// Snapshot of every pair currently awaiting retry.
    #[must_use]
    pub fn get_retry_status(&self) -> Vec<RetryMetadata> {
        self.shared.entries.iter().map(|e| e.value().clone()).collect()
    }
}

async fn run_scan_loop(shared: Arc<Shared>, mut stop_rx: oneshot::Receiver<()>) {
    let interval = Duration::from_millis(shared.config.check_interval_ms);
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            () = tokio::time::sleep(interval) => {
                let now = SystemTime::now();
                let due: Vec<(SourceName, Pair)> = shared
                    .entries
                    .iter()
                    .filter(|e| now >= e.value().next_retry_at)
                    .map(|e| e.key().clone())
                    .collect();
                if due.is_empty() {
                    continue;
                }
                let cb = shared.callback.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb(due);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FailedPairsRetryConfig {
        FailedPairsRetryConfig {
            enabled: false,
            max_attempts: 3,
            retry_delay_ms: 10,
            check_interval_ms: 15_000,
        }
    }

    #[tokio::test]
    async fn retries_to_exhaustion_then_removes_and_counts() {
        let queue = FailedPairsRetryQueue::new(config());
        let pair = Pair::new("BTC", "USDT").unwrap();
        queue.track_failed_pair(&SourceName::Binance, &pair);
        queue.track_failed_pair(&SourceName::Binance, &pair);
        queue.track_failed_pair(&SourceName::Binance, &pair);
        assert_eq!(queue.get_retry_status().len(), 1);
        queue.track_failed_pair(&SourceName::Binance, &pair);
        assert!(queue.get_retry_status().is_empty());
    }

    #[tokio::test]
    async fn remove_from_retry_queue_drops_entry() {
        let queue = FailedPairsRetryQueue::new(config());
        let pair = Pair::new("ETH", "USDT").unwrap();
        queue.track_failed_pair(&SourceName::Okx, &pair);
        queue.remove_from_retry_queue(&SourceName::Okx, &pair);
        assert!(queue.get_retry_status().is_empty());
    }
}
