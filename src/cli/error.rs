//! CLI error types and conversions

use crate::cache::CacheError;
use crate::fetcher::FetchError;
use crate::loader::LoadError;
use crate::output::OutputError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Loader error
    #[error("load error: {0}")]
    LoadError(#[from] LoadError),

    /// Cache error
    #[error("cache error: {0}")]
    CacheError(#[from] CacheError),

    /// Fetch error
    #[error("fetch error: {0}")]
    FetchError(#[from] FetchError),

    /// Output error
    #[error("output error: {0}")]
    OutputError(#[from] OutputError),

    /// Some symbols could not be fully loaded
    #[error("{failed} of {total} symbol(s) failed to load")]
    SymbolsFailed {
        /// Failed symbol count
        failed: usize,
        /// Requested symbol count
        total: usize,
    },

    /// Verification found corrupted partitions
    #[error("verification failed for {0} partition(s)")]
    VerifyFailed(usize),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
