//! End-to-end scenarios from the spec's testable-properties section, driven
//! against a fully assembled [`Engine`].

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use priceflow_engine::{
    Engine, EngineConfig, EngineError, FailedPairsRetryConfig, Pair, PairCleanupConfig, Price,
    Quote, RefetchConfig, SourceAdapterConfig, SourceConfig, SourceName,
};
use priceflow_mock::dynamic::{DynamicMockAdapter, MockBehavior};

fn disabled_background_config(sources: HashMap<String, SourceConfig>) -> EngineConfig {
    EngineConfig {
        sources,
        pair_cleanup: PairCleanupConfig { enabled: false, ..PairCleanupConfig::default() },
        refetch: RefetchConfig {
            enabled: false,
            failed_pairs_retry: FailedPairsRetryConfig { enabled: false, ..FailedPairsRetryConfig::default() },
            ..RefetchConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn quote(pair: &Pair, price: &str) -> Quote {
    Quote { pair: pair.clone(), price: Price::parse(price).unwrap(), received_at: SystemTime::now() }
}

#[tokio::test]
async fn scenario_1_cache_hit_skips_upstream() {
    let (adapter, controller) =
        DynamicMockAdapter::new_with_controller(SourceName::Binance, SourceAdapterConfig::default());
    let pair = Pair::new("BTC", "USDT").unwrap();
    let mut sources = HashMap::new();
    sources.insert("binance".to_string(), SourceConfig { ttl_ms: 5_000, ..SourceConfig::default() });

    let engine = Engine::builder(disabled_background_config(sources))
        .with_adapter(adapter)
        .build()
        .unwrap();

    // Seed through a real fetch so the cache holds the expected price, then
    // remove the quote rule so any further upstream call would fail loudly.
    controller.set_quote_behavior(&pair, MockBehavior::Return(quote(&pair, "67890.12"))).await;
    let seeded = engine.get_quote(&SourceName::Binance, &pair).await.unwrap();
    assert_eq!(seeded.price.as_str(), "67890.12");
    controller.clear_all_behaviors().await;

    let hit = engine.get_quote(&SourceName::Binance, &pair).await.unwrap();
    assert_eq!(hit.price.as_str(), "67890.12");
}

#[tokio::test]
async fn scenario_2_cache_miss_batches_other_due_pairs() {
    let (adapter, controller) =
        DynamicMockAdapter::new_with_controller(SourceName::Binance, SourceAdapterConfig::default());
    let btc = Pair::new("BTC", "USDT").unwrap();
    let eth = Pair::new("ETH", "USDT").unwrap();
    let sol = Pair::new("SOL", "USDT").unwrap();

    controller
        .set_batch_behavior(MockBehavior::Return(vec![
            quote(&btc, "67890.12"),
            quote(&eth, "3456.78"),
            quote(&sol, "145.22"),
        ]))
        .await;

    let mut sources = HashMap::new();
    sources.insert(
        "binance".to_string(),
        SourceConfig { max_batch_size: Some(3), ..SourceConfig::default() },
    );

    let engine = Engine::builder(disabled_background_config(sources))
        .with_adapter(adapter)
        .build()
        .unwrap();

    engine.registry().track_quote_request(&SourceName::Binance, &btc);
    engine.registry().track_quote_request(&SourceName::Binance, &sol);

    let got = engine.get_quote(&SourceName::Binance, &eth).await.unwrap();
    assert_eq!(got.price.as_str(), "3456.78");

    for (pair, price) in [(&btc, "67890.12"), (&eth, "3456.78"), (&sol, "145.22")] {
        let cached = engine.get_quote(&SourceName::Binance, pair).await.unwrap();
        assert_eq!(cached.price.as_str(), price);
    }
}

#[tokio::test]
async fn scenario_3_price_not_found_ejects_pair_and_increments_metric() {
    let (adapter, controller) =
        DynamicMockAdapter::new_with_controller(SourceName::Frankfurter, SourceAdapterConfig::default());
    let pair = Pair::new("XYZ", "USD").unwrap();
    controller
        .set_quote_behavior(
            &pair,
            MockBehavior::Fail(EngineError::price_not_found(pair.pair_key(), SourceName::Frankfurter)),
        )
        .await;

    let mut sources = HashMap::new();
    sources.insert("frankfurter".to_string(), SourceConfig::default());
    let engine = Engine::builder(disabled_background_config(sources))
        .with_adapter(adapter)
        .build()
        .unwrap();

    engine.registry().track_quote_request(&SourceName::Frankfurter, &pair);
    let err = engine.get_quote(&SourceName::Frankfurter, &pair).await.unwrap_err();
    assert!(matches!(err, EngineError::PriceNotFound { .. }));
    assert!(!engine.registry().get_pairs_by_source(&SourceName::Frankfurter).contains(&pair));
}

#[tokio::test(start_paused = true)]
async fn scenario_4_stale_timers_coalesce_into_one_batch() {
    use priceflow_engine::{TtlCache, TtlPolicy};

    let cache = TtlCache::new(TtlPolicy {
        source_default: HashMap::from([(SourceName::Binance, Duration::from_millis(5_000))]),
        overrides: Vec::new(),
        stale_trigger_before_expiry: Duration::from_millis(1_000),
        batch_interval: Duration::from_millis(300),
        min_time_between_refreshes: Duration::from_millis(2_000),
    });
    let mut rx = cache.take_stale_batch_receiver().unwrap();

    for symbol in ["BTC", "ETH", "SOL", "XRP", "ADA"] {
        let pair = Pair::new(symbol, "USDT").unwrap();
        cache.set(&SourceName::Binance, &pair, quote(&pair, "1.0"), None);
    }

    tokio::time::advance(Duration::from_millis(4_300)).await;
    let batch = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("a batch should have been delivered")
        .expect("channel open");
    assert_eq!(batch.items.len(), 5);
}

#[tokio::test]
async fn scenario_5_concurrent_misses_single_flight_to_one_upstream_call() {
    let (adapter, controller) =
        DynamicMockAdapter::new_with_controller(SourceName::Okx, SourceAdapterConfig::default());
    let pair = Pair::new("BTC", "USDT").unwrap();
    controller.set_quote_behavior(&pair, MockBehavior::Return(quote(&pair, "67890.12"))).await;

    let mut sources = HashMap::new();
    sources.insert("okx".to_string(), SourceConfig::default());
    let engine = std::sync::Arc::new(
        Engine::builder(disabled_background_config(sources))
            .with_adapter(adapter)
            .build()
            .unwrap(),
    );

    let (a, b) = tokio::join!(
        {
            let engine = std::sync::Arc::clone(&engine);
            let pair = pair.clone();
            async move { engine.get_quote(&SourceName::Okx, &pair).await }
        },
        {
            let engine = std::sync::Arc::clone(&engine);
            let pair = pair.clone();
            async move { engine.get_quote(&SourceName::Okx, &pair).await }
        },
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.price.as_str(), "67890.12");
    assert_eq!(a.price, b.price);
    assert_eq!(a.received_at, b.received_at);
}

#[tokio::test]
async fn scenario_6_retry_to_exhaustion_then_removed() {
    use priceflow_engine::FailedPairsRetryQueue;

    let queue = FailedPairsRetryQueue::new(FailedPairsRetryConfig {
        enabled: false,
        max_attempts: 3,
        retry_delay_ms: 10,
        check_interval_ms: 15_000,
    });
    let pair = Pair::new("BTC", "USDT").unwrap();

    for _ in 0..3 {
        queue.track_failed_pair(&SourceName::Binance, &pair);
    }
    assert_eq!(queue.get_retry_status().len(), 1);

    queue.track_failed_pair(&SourceName::Binance, &pair);
    assert!(queue.get_retry_status().is_empty());
}
