//! Loader configuration
//!
//! Everything a [`DataLoader`](super::DataLoader) needs is passed explicitly
//! through [`LoaderConfig`]; nothing is read from process-global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetcher::binance_config::SPOT_CONFIG;
use crate::loader::retry::RetryPolicy;
use crate::Timeframe;

/// Maximum attempts per chunk (first attempt included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Relative backoff jitter.
pub const DEFAULT_JITTER: f64 = 0.2;

/// Concurrent exchange requests shared by a whole batch.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// Upper bound accepted for concurrent requests.
pub const MAX_CONCURRENT_REQUESTS: usize = 32;

/// Per-attempt timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Symbols loaded concurrently by `get_many`.
pub const DEFAULT_SYMBOL_CONCURRENCY: usize = 16;

/// Explicit configuration for a data loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Root of the on-disk cache
    pub cache_dir: PathBuf,
    /// Bar granularity
    pub timeframe: Timeframe,
    /// Size of the shared worker pool
    pub max_concurrent_requests: usize,
    /// Symbols in flight at once in `get_many`
    pub symbol_concurrency: usize,
    /// Exchange weight budget per minute
    pub weight_per_minute: u32,
    /// Timeout of a single network attempt
    pub request_timeout: Duration,
    /// Retry policy applied to each chunk
    pub retry: RetryPolicy,
    /// Exchange base URL
    pub base_url: String,
    /// Optional API key sent as `X-MBX-APIKEY`
    pub api_key: Option<String>,
}

impl LoaderConfig {
    /// Defaults for one-minute bars cached under `cache_dir`
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            timeframe: Timeframe::OneMinute,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            symbol_concurrency: DEFAULT_SYMBOL_CONCURRENCY,
            weight_per_minute: SPOT_CONFIG.weight_per_minute,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            base_url: SPOT_CONFIG.base_url.to_string(),
            api_key: None,
        }
    }

    /// Set the bar granularity
    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = timeframe;
        self
    }

    /// Set the worker pool size (clamped to `1..=MAX_CONCURRENT_REQUESTS`)
    pub fn with_max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = n.clamp(1, MAX_CONCURRENT_REQUESTS);
        self
    }

    /// Set how many symbols `get_many` works on at once
    pub fn with_symbol_concurrency(mut self, n: usize) -> Self {
        self.symbol_concurrency = n.max(1);
        self
    }

    /// Set the weight budget per minute
    pub fn with_weight_per_minute(mut self, budget: u32) -> Self {
        self.weight_per_minute = budget.max(1);
        self
    }

    /// Set the per-attempt timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the exchange base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the API key
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }
}
