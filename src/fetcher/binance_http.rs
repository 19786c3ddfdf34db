//! Binance HTTP client
//!
//! Performs exactly one request per call and classifies the outcome into a
//! [`FetchError`]. Retries, rate limiting and chunking are the caller's job
//! (see [`Fetcher`](super::batch::Fetcher)).

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::fetcher::binance_config::{SpotMarketConfig, SPOT_CONFIG};
use crate::fetcher::{FetchError, FetchResult, KlineRequest, KlineSource};
use crate::metrics::{record_used_weight, HttpRequestMetrics};

/// HTTP connect timeout (seconds)
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Header carrying the weight used in the current minute
const USED_WEIGHT_HEADER: &str = "X-MBX-USED-WEIGHT-1M";

/// Header carrying the optional API key
const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Build the shared reqwest client
///
/// `request_timeout` bounds the whole request; the fetcher applies its own
/// per-attempt timeout on top.
pub fn build_http_client(request_timeout: Duration) -> FetchResult<Arc<Client>> {
    Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .timeout(request_timeout)
        .build()
        .map(Arc::new)
        .map_err(|e| FetchError::InvalidRequest(format!("failed to build HTTP client: {e}")))
}

/// Single-request client for the Binance spot API
#[derive(Clone)]
pub struct BinanceHttpClient {
    client: Arc<Client>,
    base_url: String,
    api_key: Option<String>,
    config: &'static SpotMarketConfig,
}

impl BinanceHttpClient {
    /// Create new HTTP client
    ///
    /// # Arguments
    /// * `client` - Shared HTTP client (Arc for cheap cloning)
    /// * `base_url` - Base URL for API endpoints (e.g., "<https://api.binance.com>")
    pub fn new(client: Arc<Client>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            config: &SPOT_CONFIG,
        }
    }

    /// Spot client against the production base URL
    pub fn spot(client: Arc<Client>) -> Self {
        Self::new(client, SPOT_CONFIG.base_url)
    }

    /// Send `X-MBX-APIKEY` with every request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch 24h ticker statistics for every symbol (one request)
    pub async fn fetch_tickers(&self) -> FetchResult<Vec<Value>> {
        self.get_json(self.config.ticker_24hr_endpoint, &[]).await
    }

    /// Limiter weight of one [`fetch_tickers`](Self::fetch_tickers) call
    pub fn ticker_weight(&self) -> u32 {
        self.config.ticker_24hr_weight
    }

    /// Execute one GET request and decode the JSON array body
    async fn get_json(&self, endpoint: &str, params: &[(&str, String)]) -> FetchResult<Vec<Value>> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(url = %url, params = params.len(), "Sending request");

        let metrics = HttpRequestMetrics::start(endpoint);

        let mut request = self.client.get(&url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                metrics.record("error");
                return Err(classify_transport_error(&e, endpoint));
            }
        };

        let status = response.status();
        if let Some(weight) = parse_weight_header(response.headers()) {
            record_used_weight(weight);
        }

        if !status.is_success() {
            metrics.record(status.as_str());
            let retry_after = parse_retry_after(response.headers());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status, retry_after, &body));
        }

        let body = response.json::<Value>().await.map_err(|e| {
            metrics.record("decode_error");
            FetchError::integrity(None, format!("failed to decode response body: {e}"))
        })?;
        metrics.record(status.as_str());

        match body {
            Value::Array(records) => Ok(records),
            other => Err(FetchError::integrity(
                None,
                format!("expected JSON array, got {}", json_kind(&other)),
            )),
        }
    }
}

#[async_trait]
impl KlineSource for BinanceHttpClient {
    async fn fetch_klines(&self, request: &KlineRequest) -> FetchResult<Vec<Value>> {
        // Binance treats endTime as inclusive
        let params = [
            ("symbol", request.symbol.clone()),
            ("interval", request.timeframe.to_string()),
            ("startTime", request.interval.start.to_string()),
            ("endTime", (request.interval.end - 1).to_string()),
            ("limit", request.limit.min(self.config.klines_max_limit).to_string()),
        ];
        self.get_json(self.config.klines_endpoint, &params).await
    }

    fn max_limit(&self) -> u32 {
        self.config.klines_max_limit
    }

    fn request_weight(&self) -> u32 {
        self.config.klines_weight
    }
}

/// Map a non-success status to a [`FetchError`]
///
/// 429/418 are rate limits, 5xx and 408 are transient, every other 4xx is
/// permanent.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetchError {
    match status.as_u16() {
        429 | 418 => {
            warn!(status = status.as_u16(), ?retry_after, "Rate limited by exchange");
            FetchError::RateLimitExceeded {
                status: status.as_u16(),
                retry_after,
            }
        }
        408 => FetchError::TransientNetwork(format!("server timeout {status}")),
        _ if status.is_server_error() => {
            FetchError::TransientNetwork(format!("server error {status}: {}", truncate(body)))
        }
        _ => FetchError::InvalidRequest(format!("client error {status}: {}", truncate(body))),
    }
}

fn classify_transport_error(err: &reqwest::Error, endpoint: &str) -> FetchError {
    if err.is_builder() {
        return FetchError::InvalidRequest(format!("{endpoint}: {err}"));
    }
    if err.is_timeout() {
        return FetchError::TransientNetwork(format!("{endpoint}: timeout: {err}"));
    }
    FetchError::TransientNetwork(format!("{endpoint}: {err}"))
}

/// Parse `Retry-After` given in seconds
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Extract the X-MBX-USED-WEIGHT-1M header
pub fn parse_weight_header(headers: &HeaderMap) -> Option<u32> {
    let weight_str = headers.get(USED_WEIGHT_HEADER)?.to_str().ok()?;

    match weight_str.parse::<u32>() {
        Ok(weight) => Some(weight),
        Err(e) => {
            warn!("Failed to parse weight header '{}': {}", weight_str, e);
            None
        }
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
