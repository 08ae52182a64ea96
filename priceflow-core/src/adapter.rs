//! The source adapter contract: the single capability surface every
//! upstream market-data provider implements.

use async_trait::async_trait;
use priceflow_types::SourceConfig;

use crate::error::EngineError;
use crate::stream::StreamHandle;
use crate::types::{Pair, Quote, SourceName};

/// Per-source adapter configuration, returned by [`SourceAdapter::get_config`].
///
/// This is exactly the validated [`SourceConfig`] the engine was built
/// with for this source — adapters read it rather than owning a parallel
/// copy of the same fields.
pub type SourceAdapterConfig = SourceConfig;

/// A handler invoked for every quote or error a stream session observes.
#[async_trait]
pub trait StreamService: Send + Sync {
    /// Establish the underlying connection, if not already connected.
    async fn connect(&self) -> Result<(), EngineError>;

    /// Tear down the underlying connection. Errors are logged, not propagated.
    async fn disconnect(&self);

    /// Subscribe to quote updates for `pair`, delivering them through `on_quote`
    /// and terminal errors through `on_error`.
    async fn subscribe(
        &self,
        pair: &Pair,
        on_quote: Box<dyn Fn(Quote) + Send + Sync>,
        on_error: Box<dyn Fn(EngineError) + Send + Sync>,
    ) -> Result<(), EngineError>;

    /// Unsubscribe from `pair`. Reference-counted by the caller: only the
    /// last unsubscribe for a given pair actually tears down upstream state.
    async fn unsubscribe(&self, pair: &Pair) -> Result<(), EngineError>;
}

/// The uniform contract every upstream market-data provider implements.
///
/// Deliberately a single trait: this engine has one capability surface
/// (quotes, optionally batched, optionally streamed), so capability
/// discovery is a pair of cheap predicate/accessor methods rather than a
/// family of `as_*_provider() -> Option<&dyn Trait>` downcasts.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// This adapter's stable source identity.
    fn name(&self) -> SourceName;

    /// This adapter's current configuration.
    fn get_config(&self) -> SourceAdapterConfig;

    /// Fetch the current quote for a single pair. Required.
    async fn fetch_quote(&self, pair: &Pair) -> Result<Quote, EngineError>;

    /// Whether [`fetch_quotes`](Self::fetch_quotes) is implemented.
    ///
    /// The batch coordinator (component G) consults this before attempting
    /// a batched call; adapters that return `false` are only ever called
    /// through [`fetch_quote`](Self::fetch_quote).
    fn supports_batch(&self) -> bool {
        false
    }

    /// Fetch quotes for multiple pairs in one upstream call.
    ///
    /// Only called when [`supports_batch`](Self::supports_batch) returns
    /// `true`. May legitimately return a subset if the provider silently
    /// omits unknown pairs. Must fail with
    /// [`EngineError::BatchSizeExceeded`] when `pairs` exceeds this
    /// adapter's configured `max_batch_size`.
    async fn fetch_quotes(&self, pairs: &[Pair]) -> Result<Vec<Quote>, EngineError> {
        let _ = pairs;
        Err(EngineError::SourceUnsupported {
            name: self.name().to_string(),
        })
    }

    /// Enumerate the universe of pairs this adapter knows about, for
    /// diagnostics. Optional; default is an empty universe.
    fn get_pairs(&self) -> Vec<Pair> {
        Vec::new()
    }

    /// Return this adapter's streaming sub-contract, if it supports one.
    fn stream_service(&self) -> Option<&dyn StreamService> {
        None
    }
}

/// A handle returned by a long-lived adapter task (e.g. a WebSocket driver
/// loop), re-exported here so adapter implementations don't need a direct
/// dependency on the `stream` module's internals.
pub type AdapterStreamHandle = StreamHandle;
