//! The pricing engine: aggregates quotes from multiple market-data sources
//! behind a single `get_quote(source, pair)` call.
//!
//! Overview
//! - A TTL cache fronts every quote; hits never touch an upstream source.
//! - Misses are single-flighted per `(source, pair)` so concurrent callers
//!   share one upstream fetch instead of piling on.
//! - Sources that support batch fetches get their misses bundled with other
//!   due pairs from the same source, amortizing rate limits.
//! - A background scheduler proactively refetches cache entries shortly
//!   before they expire, and retries pairs that failed with bounded backoff.
//! - Streaming-capable sources are subscribed reference-counted per pair and
//!   fed straight into the same cache, so `get_quote` sees pushed updates as
//!   cache hits.
//! - Pairs nobody has asked for in a while are swept out of the registry
//!   (and therefore out of the cache and streaming subscriptions).
//!
//! Key behaviors and trade-offs
//! - Cache staleness: one dedicated background task drives every pending
//!   stale timer off a min-heap rather than a timer per key, coalescing
//!   near-simultaneous expirations into a single `StaleBatch`.
//! - Batch fetch: `build_batch` always keeps the originally requested pair
//!   first; other due pairs from the same source fill the remaining slots,
//!   oldest-fetched-first, up to the source's configured `max_batch_size`.
//! - Failed-pair retry: bounded attempts with a fixed delay; a pair is
//!   dropped from the queue once it exceeds `max_attempts`, not retried
//!   forever.
//! - Pair cleanup: registrations are evicted on inactivity, not on cache
//!   expiry, so a pair can still be "warm" in the cache while about to be
//!   swept if nobody has requested it recently.
#![warn(missing_docs)]

mod batch;
mod cache;
mod cleanup;
mod engine;
mod metrics;
mod quotes;
mod refetch;
mod registry;
mod retry;
mod sources;
mod streaming;

pub use cache::{TtlCache, TtlPolicy};
pub use engine::{Engine, EngineBuilder};
pub use quotes::{MaxBatchSizes, QuotesService};
pub use refetch::{RefetchScheduler, SourceRefetchMeta};
pub use registry::{PairRegistry, RegistryEvent};
pub use retry::FailedPairsRetryQueue;
pub use sources::SourcesManager;
pub use streaming::StreamingCoordinator;
pub use streaming::session::StreamSessionState;

pub use priceflow_core::{
    CacheMetadata, CachedQuote, EngineError, Pair, PairRegistration, Price, Quote, QuoteResponse,
    RetryMetadata, SourceAdapter, SourceAdapterConfig, SourceName, StaleBatch, StaleItem,
    StreamService,
};
pub use priceflow_types::{
    BackoffConfig, ConfigError, EngineConfig, Environment, FailedPairsRetryConfig, LoggerConfig,
    PairCleanupConfig, PairTtlOverride, ProxySetting, RefetchConfig, SourceConfig, StreamConfig,
};
