//! Retry message formatting.
//!
//! Keeps retry, recovery and give-up log lines consistent across the fetcher:
//! every line names the attempt counter, the failure class, the wait, and the
//! symbol and chunk involved.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::coverage::Interval;
use crate::fetcher::FetchError;

/// Classification of fetch failures for user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Attempt exceeded the per-request timeout
    NetworkTimeout,
    /// HTTP 429 rate limit exceeded
    RateLimit,
    /// HTTP 418 IP ban after ignored rate limits
    IpBanned,
    /// Connection, DNS or 5xx failure
    NetworkGeneric,
    /// HTTP 4xx invalid request / bad symbol
    InvalidRequest,
    /// Payload failed validation
    DataIntegrity,
    /// Load was cancelled
    Cancelled,
}

impl RetryErrorType {
    /// Classify a [`FetchError`]
    pub fn from_error(error: &FetchError) -> Self {
        match error {
            FetchError::Timeout(_) => Self::NetworkTimeout,
            FetchError::RateLimitExceeded { status: 418, .. } => Self::IpBanned,
            FetchError::RateLimitExceeded { .. } => Self::RateLimit,
            FetchError::TransientNetwork(msg) if msg.contains("timeout") => Self::NetworkTimeout,
            FetchError::TransientNetwork(_) => Self::NetworkGeneric,
            FetchError::InvalidRequest(_) => Self::InvalidRequest,
            FetchError::DataIntegrity { .. } => Self::DataIntegrity,
            FetchError::Cancelled => Self::Cancelled,
        }
    }

    /// Short description used inside retry log messages.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::RateLimit => "rate limit exceeded",
            Self::IpBanned => "IP temporarily banned (418)",
            Self::NetworkGeneric => "network error",
            Self::InvalidRequest => "invalid request",
            Self::DataIntegrity => "invalid exchange data",
            Self::Cancelled => "cancelled",
        }
    }

    /// Suggested remediation shown after a final failure.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check your network connection or raise --request-timeout-secs",
            Self::RateLimit | Self::IpBanned => "Lower --concurrency or --weight-per-minute",
            Self::NetworkGeneric => "Exchange may be experiencing issues, try again later",
            Self::InvalidRequest => "Check the symbol and date range for typos",
            Self::DataIntegrity => "Re-run later; the exchange returned an incomplete series",
            Self::Cancelled => "Re-run the command; completed chunks are already cached",
        }
    }
}

/// Context for formatting retry messages.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Type of error that triggered retry
    pub error_type: RetryErrorType,
    /// Backoff duration until next attempt
    pub backoff_duration: Duration,
    /// Symbol being fetched
    pub symbol: String,
    /// Chunk being fetched
    pub chunk: Interval,
    /// Original error message
    pub error_message: String,
}

impl RetryContext {
    /// Context for `error` on `attempt` of `chunk`
    pub fn new(
        attempt: u32,
        max_attempts: u32,
        error: &FetchError,
        backoff_duration: Duration,
        symbol: impl Into<String>,
        chunk: Interval,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            error_type: RetryErrorType::from_error(error),
            backoff_duration,
            symbol: symbol.into(),
            chunk,
            error_message: error.to_string(),
        }
    }

    /// Retry notice with attempt counter and wait.
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds... ({}) {}",
            self.attempt + 1,
            self.max_attempts,
            self.error_type.description(),
            self.backoff_duration.as_secs_f64(),
            self.symbol,
            format_range(&self.chunk)
        )
    }

    /// Notice that a retried chunk eventually succeeded.
    pub fn format_success(&self) -> String {
        format!(
            "Retry attempt {}/{} succeeded ({}) {}",
            self.attempt,
            self.max_attempts,
            self.symbol,
            format_range(&self.chunk)
        )
    }

    /// Final failure summary with a remediation hint.
    pub fn format_failure(&self) -> String {
        [
            format!("[FAILED] Chunk failed after {} attempt(s)", self.attempt),
            format!("  Last error: {}", self.error_message),
            format!("  Symbol: {}", self.symbol),
            format!("  Range: {}", format_range(&self.chunk)),
            format!("  Suggestion: {}", self.error_type.suggestion()),
        ]
        .join("\n")
    }
}

fn format_range(interval: &Interval) -> String {
    format!(
        "{} to {}",
        format_timestamp(interval.start),
        format_timestamp(interval.end)
    )
}

fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}
