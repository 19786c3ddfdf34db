//! Exchange access: the single-request client, the response parser, gap
//! chunking and the batch [`Fetcher`](batch::Fetcher) that drives them under the
//! shared worker pool and rate limiter.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::coverage::Interval;
use crate::{Bar, Timeframe};

pub mod batch;
pub mod binance_config;
pub mod binance_http;
pub mod binance_parser;
pub mod chunking;
pub mod pairs;
pub mod retry_formatter;

pub use batch::Fetcher;
pub use binance_http::BinanceHttpClient;

/// Failure of a single exchange call or of the parse that follows it
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// Connection reset, DNS failure or 5xx response
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Attempt exceeded the per-request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP 429/418 from the exchange
    #[error("rate limit exceeded (HTTP {status}){}", retry_after_suffix(.retry_after))]
    RateLimitExceeded {
        /// Status code returned (429 or 418)
        status: u16,
        /// Server-provided `Retry-After`
        retry_after: Option<Duration>,
    },

    /// Unknown symbol or malformed parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Payload could not be turned into a valid contiguous bar sequence
    #[error("data integrity error{}: {message}", timestamp_suffix(.timestamp))]
    DataIntegrity {
        /// Open time of the first offending record, when known
        timestamp: Option<i64>,
        /// What was wrong with it
        message: String,
    },

    /// The owning load was cancelled before this attempt started
    #[error("cancelled")]
    Cancelled,
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry after {:.1}s", d.as_secs_f64()))
        .unwrap_or_default()
}

fn timestamp_suffix(timestamp: &Option<i64>) -> String {
    timestamp.map(|t| format!(" at {t}")).unwrap_or_default()
}

impl FetchError {
    /// Build a [`FetchError::DataIntegrity`] for a record at `timestamp`
    pub fn integrity(timestamp: impl Into<Option<i64>>, message: impl Into<String>) -> Self {
        FetchError::DataIntegrity {
            timestamp: timestamp.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::TransientNetwork(_)
                | FetchError::Timeout(_)
                | FetchError::RateLimitExceeded { .. }
        )
    }

    /// Server-imposed minimum wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type for fetcher operations
pub type FetchResult<T> = Result<T, FetchError>;

/// One exchange call: at most `limit` bars of `timeframe` inside `interval`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KlineRequest {
    /// Exchange symbol (already normalized)
    pub symbol: String,
    /// Bar granularity
    pub timeframe: Timeframe,
    /// Requested range; the client translates the exclusive end itself
    pub interval: Interval,
    /// Maximum number of candles asked for
    pub limit: u32,
}

/// Bounded, single-call source of raw kline records
///
/// Implementations know nothing about multi-call ranges, retries or caching.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Perform exactly one request and return the undecoded records
    async fn fetch_klines(&self, request: &KlineRequest) -> FetchResult<Vec<Value>>;

    /// Maximum candles per call
    fn max_limit(&self) -> u32;

    /// Rate-limit weight of one call
    fn request_weight(&self) -> u32;
}

/// Bars fetched for one contiguous, timeframe-aligned interval
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRun {
    /// Exact span covered by `bars`
    pub interval: Interval,
    /// Ascending, contiguous bars
    pub bars: Vec<Bar>,
}

/// A gap that could only be partly fetched
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to fetch {symbol} {failed_sub_interval}: {cause}")]
pub struct PartialFetchError {
    /// Symbol being fetched
    pub symbol: String,
    /// The gap this error belongs to
    pub gap: Interval,
    /// Span from the first to the last failed chunk, clipped to the gap
    pub failed_sub_interval: Interval,
    /// Error of the first failed chunk
    pub cause: FetchError,
    /// Successfully fetched contiguous runs of the gap, ready to commit
    pub fetched: Vec<FetchedRun>,
}

/// Per-gap outcome of [`Fetcher::fill`](batch::Fetcher::fill)
pub type GapResult = Result<FetchedRun, PartialFetchError>;
