//! Data loader: the consumer-facing facade over cache and fetcher
//!
//! # Overview
//!
//! A [`DataLoader::get`] call walks a fixed sequence of phases
//! ([`job::LoadPhase`]):
//!
//! 1. **Planning**: compute the gaps between the request and the cache
//! 2. **Filling**: fetch every gap through the shared [`Fetcher`] and commit
//!    each completed gap (or fetched run of a failed gap) immediately
//! 3. **Assembling**: read exactly the requested range back from the cache
//!
//! # Quick Start
//!
//! ```no_run
//! use kline_cache::loader::{DataLoader, LoaderConfig};
//! use kline_cache::Interval;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = DataLoader::binance(LoaderConfig::new("./data/cache"))?;
//! let january = Interval::new(1_704_067_200_000, 1_706_745_600_000)?;
//! let results = loader.get_many(&["ETHBTC", "LTCBTC"], january).await;
//! for (symbol, result) in results {
//!     println!("{symbol}: {} bars", result?.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`config`] - Explicit loader configuration and defaults
//! - [`rate_limit`] - Token bucket shared by every request
//! - [`retry`] - Exponential backoff policy
//! - [`job`] - Phase tracking for a single load
//!
//! [`Fetcher`]: crate::fetcher::Fetcher

pub mod config;
pub mod data_loader;
pub mod job;
pub mod rate_limit;
pub mod retry;

pub use config::LoaderConfig;
pub use data_loader::DataLoader;
pub use job::{LoadPhase, LoadSummary};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::RetryPolicy;

use crate::cache::{format_intervals, CacheError};
use crate::coverage::Interval;
use crate::fetcher::FetchError;

/// Data loader errors
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Malformed request (unknown symbol form, empty or misaligned range)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Part of the request could not be filled; committed progress is kept
    #[error(
        "{symbol}: missing {missing_sub_interval} ({} range(s) missing: {}){}",
        .missing.len(),
        format_intervals(.missing),
        .cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default()
    )]
    PartialCoverage {
        /// Symbol requested
        symbol: String,
        /// Smallest range spanning everything still missing
        missing_sub_interval: Interval,
        /// Every uncovered range, ascending
        missing: Vec<Interval>,
        /// First fetch failure that left the range unfilled
        cause: Option<FetchError>,
    },

    /// The call was cancelled before the range was filled
    #[error("{symbol}: cancelled with {} range(s) still missing", .missing.len())]
    Cancelled {
        /// Symbol requested
        symbol: String,
        /// Ranges still missing when the call gave up
        missing: Vec<Interval>,
    },

    /// Cache failure
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Exchange client could not be set up
    #[error("client setup failed: {0}")]
    Setup(#[from] FetchError),

    /// A background gap task panicked or was aborted
    #[error("gap task failed: {0}")]
    Task(String),

    /// Phase machine misuse
    #[error("invalid load phase transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Phase before
        from: LoadPhase,
        /// Rejected phase
        to: LoadPhase,
    },
}

impl LoadError {
    /// Ranges still uncovered, if this error carries them
    pub fn missing(&self) -> &[Interval] {
        match self {
            LoadError::PartialCoverage { missing, .. } | LoadError::Cancelled { missing, .. } => missing,
            _ => &[],
        }
    }
}

/// Result type for loader operations
pub type LoadResult<T> = Result<T, LoadError>;
