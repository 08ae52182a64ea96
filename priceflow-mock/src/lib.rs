//! priceflow-mock
//!
//! A fully controllable mock [`priceflow_core::SourceAdapter`] for
//! integration tests, driven by an external controller rather than
//! hard-coded fixtures.
#![warn(missing_docs)]

pub mod dynamic;

pub use dynamic::{DynamicMockAdapter, DynamicMockController, MockBehavior, StreamBehavior};
