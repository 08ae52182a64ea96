//! Rate-limited, proxied HTTP client (component A).
//!
//! One client is constructed per source. It enforces a requests-per-second
//! token bucket, a max-in-flight cap, and a per-request timeout, and merges
//! default params/headers with per-call ones.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use priceflow_core::EngineError;
use priceflow_types::ProxySetting;
use serde_json::Value;
use tokio::sync::Semaphore;

type TokenBucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// The response shape returned by [`RateLimitedHttpClient::get`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: u16,
    /// Response headers, lowercased.
    pub headers: HashMap<String, String>,
    /// The parsed JSON body, or `Value::Null` if the body was empty.
    pub data: Value,
}

/// Per-call overrides merged with a client's defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Query params; per-call keys win over the client's defaults.
    pub params: HashMap<String, String>,
    /// Extra headers; per-call keys win over the client's defaults.
    pub headers: HashMap<String, String>,
}

/// A rate-limited, proxied, timeout-bounded HTTP client for one source.
pub struct RateLimitedHttpClient {
    source: String,
    base_url: String,
    timeout: Duration,
    default_params: HashMap<String, String>,
    default_headers: HashMap<String, String>,
    limiter: Option<Arc<TokenBucket>>,
    concurrency: Arc<Semaphore>,
    client: reqwest::Client,
}

impl RateLimitedHttpClient {
    /// Start building a client for `source`.
    #[must_use]
    pub fn builder(source: impl Into<String>, base_url: impl Into<String>) -> HttpClientBuilder {
        HttpClientBuilder::new(source, base_url)
    }

    /// Issue a `GET` request against `path`, merging `opts` with this
    /// client's defaults.
    ///
    /// Behavior and trade-offs:
    /// - Waits for a rate-limit token before acquiring a concurrency permit,
    ///   so a saturated bucket doesn't hold a permit while idle.
    /// - The permit is held for the full request including timeout; callers
    ///   queue FIFO once `max_concurrent` in-flight requests are active.
    /// - A non-2xx status is returned as `Ok` with that status set; only
    ///   transport failures and timeouts become `Err`.
    ///
    /// # Errors
    /// Returns [`EngineError::Timeout`] if the request exceeds its timeout,
    /// or [`EngineError::SourceApi`] for transport-level failures.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, opts), fields(source = %self.source)))]
    pub async fn get(&self, path: &str, opts: RequestOptions) -> Result<HttpResponse, EngineError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        let _permit =
            self.concurrency
                .acquire()
                .await
                .map_err(|_| EngineError::SourceApi {
                    source: source_name(&self.source),
                    status: None,
                })?;

        let mut params = self.default_params.clone();
        params.extend(opts.params);
        let mut headers = self.default_headers.clone();
        headers.extend(opts.headers);

        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url).query(&params);
        for (k, v) in &headers {
            req = req.header(k, v);
        }

        let fut = req.send();
        let resp = tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            EngineError::timeout(source_name(&self.source), path.to_string(), self.timeout.as_millis() as u64)
        })?;

        let resp = resp.map_err(|e| EngineError::SourceApi {
            source: source_name(&self.source),
            status: e.status().map(|s| s.as_u16()),
        })?;

        let status = resp.status().as_u16();
        let resp_headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string().to_lowercase(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let data = resp.json::<Value>().await.unwrap_or(Value::Null);

        Ok(HttpResponse {
            status,
            headers: resp_headers,
            data,
        })
    }
}

fn source_name(s: &str) -> priceflow_core::SourceName {
    priceflow_core::SourceName::Other(s.to_string())
}

/// Builder for [`RateLimitedHttpClient`].
pub struct HttpClientBuilder {
    source: String,
    base_url: String,
    timeout: Duration,
    max_concurrent: u32,
    rps: Option<f64>,
    use_proxy: ProxySetting,
    default_params: HashMap<String, String>,
    default_headers: HashMap<String, String>,
}

impl HttpClientBuilder {
    /// Start a new builder for `source` talking to `base_url`.
    #[must_use]
    pub fn new(source: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            max_concurrent: 10,
            rps: None,
            use_proxy: ProxySetting::Disabled,
            default_params: HashMap::new(),
            default_headers: HashMap::new(),
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the max in-flight request cap.
    #[must_use]
    pub const fn max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the requests-per-second budget. `None` disables throttling.
    #[must_use]
    pub const fn rps(mut self, rps: Option<f64>) -> Self {
        self.rps = rps;
        self
    }

    /// Set the proxy behavior for this client's requests.
    #[must_use]
    pub fn use_proxy(mut self, use_proxy: ProxySetting) -> Self {
        self.use_proxy = use_proxy;
        self
    }

    /// Merge in default query params applied to every request.
    #[must_use]
    pub fn default_params(mut self, params: HashMap<String, String>) -> Self {
        self.default_params = params;
        self
    }

    /// Merge in default headers applied to every request.
    #[must_use]
    pub fn default_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.default_headers = headers;
        self
    }

    /// Build the client.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] if a proxy URL is set but fails to parse.
    pub fn build(self) -> Result<RateLimitedHttpClient, EngineError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        match &self.use_proxy {
            ProxySetting::Disabled => {}
            ProxySetting::Enabled(true) | ProxySetting::Url(_) => {
                let proxy_url = match &self.use_proxy {
                    ProxySetting::Url(url) => url.clone(),
                    _ => std::env::var("HTTPS_PROXY").unwrap_or_default(),
                };
                if !proxy_url.is_empty() {
                    let proxy = reqwest::Proxy::all(&proxy_url)
                        .map_err(|e| EngineError::Config(format!("invalid proxy url: {e}")))?;
                    builder = builder.proxy(proxy);
                }
            }
            ProxySetting::Enabled(false) => {}
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build http client: {e}")))?;

        let limiter = self.rps.map(|rps| {
            let per_second = NonZeroU32::new(rps.ceil().max(1.0) as u32).unwrap_or(NonZeroU32::MIN);
            Arc::new(RateLimiter::direct(Quota::per_second(per_second)))
        });

        Ok(RateLimitedHttpClient {
            source: self.source,
            base_url: self.base_url,
            timeout: self.timeout,
            default_params: self.default_params,
            default_headers: self.default_headers,
            limiter,
            concurrency: Arc::new(Semaphore::new(self.max_concurrent.max(1) as usize)),
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_sane() {
        let client = HttpClientBuilder::new("binance", "https://api.binance.com")
            .build()
            .unwrap();
        assert_eq!(client.source, "binance");
        assert_eq!(client.concurrency.available_permits(), 10);
    }

    #[test]
    fn zero_rps_rounds_up_to_one_token() {
        let client = HttpClientBuilder::new("okx", "https://okx.example")
            .rps(Some(0.2))
            .build()
            .unwrap();
        assert!(client.limiter.is_some());
    }
}
