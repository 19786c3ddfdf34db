//! # kline-cache
//!
//! Gap-aware local cache of exchange minute bars, built to feed strategy
//! backtests that sweep ~100 trading pairs over a fixed historical window.
//!
//! ## Features
//!
//! - **Coverage bookkeeping**: every (symbol, timeframe) partition tracks the
//!   half-open intervals it already holds, so repeated runs fetch only gaps
//! - **Bounded concurrency**: one worker pool and one token-bucket rate limiter
//!   shared by every symbol in a batch
//! - **Retry policy**: exponential backoff with jitter, honoring server
//!   `Retry-After` hints, with permanent errors failing fast
//! - **Crash safety**: bar blocks are fsynced before the coverage record that
//!   references them is atomically replaced
//! - **Strict parsing**: raw klines are validated eagerly; a missing minute is
//!   an integrity error, never interpolated
//!
//! ## Quick Start
//!
//! ```no_run
//! use kline_cache::coverage::Interval;
//! use kline_cache::loader::{DataLoader, LoaderConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoaderConfig::new("./data/cache");
//! let loader = DataLoader::binance(config)?;
//!
//! // February 2025, one-minute bars
//! let requested = Interval::new(1_738_368_000_000, 1_740_787_200_000)?;
//! let bars = loader.get("ETHBTC", requested).await?;
//! println!("loaded {} bars", bars.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`coverage`] - Half-open intervals and coalesced coverage sets
//! - [`fetcher`] - Exchange client, response parser, chunking and the batch fetcher
//! - [`cache`] - Durable per-partition coverage records and bar blocks
//! - [`loader`] - The `get` facade, rate limiter, retry policy and configuration
//! - [`output`] - Aggregated CSV export for the simulation side
//! - [`cli`] - Command-line entry points

#![warn(missing_docs)]
#![warn(clippy::all)]

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Cache manager: coverage records, bar blocks and partition locking
pub mod cache;

/// CLI command implementations
pub mod cli;

/// Intervals and coverage sets
pub mod coverage;

/// Exchange client, parser and batch fetcher
pub mod fetcher;

/// Data loader facade and fetch scheduling policy
pub mod loader;

/// Metrics emission
pub mod metrics;

/// Aggregated bar export
pub mod output;

/// Cancellation tokens shared between the CLI and in-flight loads
pub mod shutdown;

pub use coverage::{CoverageSet, Interval};
pub use loader::{DataLoader, LoaderConfig};

/// One OHLCV bar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    /// Open time (Unix timestamp in milliseconds, aligned to the timeframe)
    pub open_time: i64,
    /// Open price
    pub open: Decimal,
    /// High price
    pub high: Decimal,
    /// Low price
    pub low: Decimal,
    /// Close price
    pub close: Decimal,
    /// Volume (base asset)
    pub volume: Decimal,
}

impl Bar {
    /// Validate bar data integrity
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ] {
            if value < Decimal::ZERO {
                return Err(format!("{name} must be non-negative, got {value}"));
            }
        }

        if self.high < self.open || self.high < self.close {
            return Err(format!(
                "High ({}) must be >= open ({}) and close ({})",
                self.high, self.open, self.close
            ));
        }

        if self.low > self.open || self.low > self.close {
            return Err(format!(
                "Low ({}) must be <= open ({}) and close ({})",
                self.low, self.open, self.close
            ));
        }

        Ok(())
    }
}

/// Fixed bar granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1 minute
    #[serde(rename = "1m")]
    OneMinute,
    /// 3 minutes
    #[serde(rename = "3m")]
    ThreeMinutes,
    /// 5 minutes
    #[serde(rename = "5m")]
    FiveMinutes,
    /// 15 minutes
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// 30 minutes
    #[serde(rename = "30m")]
    ThirtyMinutes,
    /// 1 hour
    #[serde(rename = "1h")]
    OneHour,
    /// 4 hours
    #[serde(rename = "4h")]
    FourHours,
    /// 1 day
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    /// Bar duration in milliseconds
    pub fn to_milliseconds(&self) -> i64 {
        match self {
            Timeframe::OneMinute => 60_000,
            Timeframe::ThreeMinutes => 180_000,
            Timeframe::FiveMinutes => 300_000,
            Timeframe::FifteenMinutes => 900_000,
            Timeframe::ThirtyMinutes => 1_800_000,
            Timeframe::OneHour => 3_600_000,
            Timeframe::FourHours => 14_400_000,
            Timeframe::OneDay => 86_400_000,
        }
    }

    /// Whether `timestamp` falls exactly on a bar boundary
    pub fn is_aligned(&self, timestamp: i64) -> bool {
        timestamp.rem_euclid(self.to_milliseconds()) == 0
    }

    /// Exchange wire name (also used as the cache directory name)
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::ThreeMinutes => "3m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::ThirtyMinutes => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::OneMinute),
            "3m" => Ok(Timeframe::ThreeMinutes),
            "5m" => Ok(Timeframe::FiveMinutes),
            "15m" => Ok(Timeframe::FifteenMinutes),
            "30m" => Ok(Timeframe::ThirtyMinutes),
            "1h" => Ok(Timeframe::OneHour),
            "4h" => Ok(Timeframe::FourHours),
            "1d" => Ok(Timeframe::OneDay),
            _ => Err(format!("Invalid timeframe: {s}")),
        }
    }
}

/// Normalize a user-facing symbol ("eth/btc", "ETH-BTC") to exchange form ("ETHBTC")
///
/// Returns `None` when nothing alphanumeric is left or a character outside
/// `[A-Za-z0-9/_-]` is present, so the result is always safe as a directory name.
pub fn normalize_symbol(symbol: &str) -> Option<String> {
    let mut normalized = String::with_capacity(symbol.len());
    for c in symbol.trim().chars() {
        match c {
            '/' | '-' | '_' => {}
            c if c.is_ascii_alphanumeric() => normalized.push(c.to_ascii_uppercase()),
            _ => return None,
        }
    }
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
