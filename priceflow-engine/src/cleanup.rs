//! Pair cleanup scheduler (§4.L): periodically evicts registrations that
//! haven't been requested in a while, keeping the registry (and therefore the
//! cache and streaming subscriptions) from accumulating dead pairs forever.

use std::sync::Arc;
use std::time::Duration;

use priceflow_types::PairCleanupConfig;
use tokio::sync::oneshot;

use crate::metrics;
use crate::registry::PairRegistry;

struct CleanupTask {
    join: Option<tokio::task::JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        priceflow_core::stream::drop_impl(&mut self.join, &mut self.stop_tx);
    }
}

/// Sweeps the pair registry on a fixed interval, removing registrations that
/// have gone `inactive_timeout` without a request.
pub struct PairCleanupScheduler {
    registry: Arc<PairRegistry>,
    config: PairCleanupConfig,
    _task: CleanupTask,
}

impl PairCleanupScheduler {
    /// Build the scheduler and spawn its periodic sweep, if enabled.
    #[must_use]
    pub fn new(registry: Arc<PairRegistry>, config: PairCleanupConfig) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = if config.enabled {
            Some(tokio::spawn(run_sweep_loop(
                Arc::clone(&registry),
                config,
                stop_rx,
            )))
        } else {
            drop(stop_rx);
            None
        };
        Self {
            registry,
            config,
            _task: CleanupTask { join, stop_tx: Some(stop_tx) },
        }
    }

    /// Run one sweep immediately, outside of the scheduled interval, returning
    /// the number of registrations removed. Useful for an admin-triggered
    /// cleanup or in tests.
    pub fn run_once(&self) -> usize {
        let removed = self
            .registry
            .cleanup_inactive_pairs(Duration::from_millis(self.config.inactive_timeout_ms));
        metrics::pairs_total(self.registry.get_all_registrations().len());
        removed
    }
}

async fn run_sweep_loop(registry: Arc<PairRegistry>, config: PairCleanupConfig, mut stop_rx: oneshot::Receiver<()>) {
    let interval = Duration::from_millis(config.cleanup_interval_ms);
    let inactive_timeout = Duration::from_millis(config.inactive_timeout_ms);
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            () = tokio::time::sleep(interval) => {
                let removed = registry.cleanup_inactive_pairs(inactive_timeout);
                if removed > 0 {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(removed, "swept inactive pairs");
                }
                metrics::pairs_total(registry.get_all_registrations().len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use priceflow_core::{Pair, SourceName};

    fn config() -> PairCleanupConfig {
        PairCleanupConfig {
            enabled: false,
            inactive_timeout_ms: 0,
            cleanup_interval_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn run_once_removes_inactive_registrations() {
        let registry = Arc::new(PairRegistry::new());
        let pair = Pair::new("BTC", "USDT").unwrap();
        registry.track_quote_request(&SourceName::Binance, &pair);

        let scheduler = PairCleanupScheduler::new(Arc::clone(&registry), config());
        let removed = scheduler.run_once();
        assert_eq!(removed, 1);
        assert!(registry.get_all_registrations().is_empty());
    }

    #[tokio::test]
    async fn run_once_keeps_recently_active_registrations() {
        let registry = Arc::new(PairRegistry::new());
        let pair = Pair::new("ETH", "USDT").unwrap();
        registry.track_quote_request(&SourceName::Binance, &pair);

        let scheduler = PairCleanupScheduler::new(
            Arc::clone(&registry),
            PairCleanupConfig {
                enabled: false,
                inactive_timeout_ms: 3_600_000,
                cleanup_interval_ms: 60_000,
            },
        );
        let removed = scheduler.run_once();
        assert_eq!(removed, 0);
        assert_eq!(registry.get_all_registrations().len(), 1);
    }
}
