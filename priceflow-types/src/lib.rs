//! priceflow-types
//!
//! The typed configuration schema the pricing engine is built from.
//! Parsing this schema out of a file or environment variables is out of
//! scope here; only the shape and its validation rules live in this crate.
#![warn(missing_docs)]

mod config;

pub use config::{
    BackoffConfig, ConfigError, EngineConfig, Environment, FailedPairsRetryConfig, LoggerConfig,
    PairCleanupConfig, PairTtlOverride, ProxySetting, RefetchConfig, SourceConfig, StreamConfig,
    millis,
};
