//! priceflow-net
//!
//! Transport primitives shared by every source adapter:
//!
//! - `http`: a rate-limited, proxied HTTP client (component A).
//! - `ws`: a reconnecting WebSocket client with heartbeat and backoff
//!   (component B).
#![warn(missing_docs)]

pub mod http;
pub mod ws;

pub use http::{HttpClientBuilder, HttpResponse, RateLimitedHttpClient, RequestOptions};
pub use ws::{WsConfig, WsEvent, WsHandle, WsMessage};
