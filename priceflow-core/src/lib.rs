//! priceflow-core
//!
//! Shared data model, error taxonomy, and the source adapter contract for the
//! priceflow pricing engine.
//!
//! - `types`: pairs, quotes, cache metadata, registrations, retry metadata.
//! - `error`: the stable `EngineError` taxonomy shared by every component.
//! - `adapter`: the `SourceAdapter` contract and streaming sub-contract.
//! - `stream`: a minimal stream handle abstraction for long-lived tasks.
#![warn(missing_docs)]

pub mod adapter;
pub mod error;
pub mod stream;
pub mod types;

pub use adapter::{SourceAdapter, SourceAdapterConfig, StreamService};
pub use error::EngineError;
pub use stream::StreamHandle;
pub use types::*;
