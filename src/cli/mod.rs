//! CLI command implementations

use chrono::{DateTime, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetcher::binance_config::SPOT_CONFIG;
use crate::loader::config::MAX_CONCURRENT_REQUESTS;
use crate::loader::{LoaderConfig, RetryPolicy};
use crate::Timeframe;

pub mod coverage;
pub mod error;
pub mod fetch;
pub mod pairs;

pub use coverage::{CoverageArgs, VerifyArgs};
pub use error::CliError;
pub use fetch::FetchArgs;
pub use pairs::PairsArgs;

/// Default cache directory
pub const DEFAULT_CACHE_DIR: &str = "data/cache";

/// Smallest weight budget that still fits one kline request in the burst
const MIN_WEIGHT_PER_MINUTE: u32 = 20;

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENT_REQUESTS {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENT_REQUESTS}"
        ));
    }
    Ok(value)
}

/// Kline cache CLI
#[derive(Parser, Debug)]
#[command(name = "kline-cache")]
#[command(about = "Fill and inspect a local cache of Binance minute bars", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, value_enum, default_value = "human")]
    pub output_format: OutputFormat,

    /// Cache root directory (default: data/cache)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Bar granularity
    #[arg(long, global = true, default_value = "1m")]
    pub timeframe: Timeframe,

    /// Concurrent exchange requests shared by all symbols (default: 8, max: 32)
    #[arg(long, global = true, value_parser = parse_concurrency)]
    pub concurrency: Option<usize>,

    /// Maximum attempts per request (default: 5, range: 1-20)
    #[arg(long, global = true, default_value = "5", value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_retries: u32,

    /// Exchange request weight budget per minute
    #[arg(long, global = true, default_value_t = SPOT_CONFIG.weight_per_minute)]
    pub weight_per_minute: u32,

    /// Timeout of one request attempt in seconds
    #[arg(long, global = true, default_value = "30", value_parser = clap::value_parser!(u64).range(1..=300))]
    pub request_timeout_secs: u64,

    /// Exchange REST base URL
    #[arg(long, global = true, default_value = SPOT_CONFIG.base_url)]
    pub base_url: String,

    /// Optional API key sent as X-MBX-APIKEY
    #[arg(long, global = true)]
    pub api_key: Option<String>,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,

    /// JSON run file with symbols, start, end, cache_dir and concurrency
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fill the cache for a set of symbols over a date range
    Fetch(FetchArgs),

    /// List the most liquid pairs quoted in an asset
    Pairs(PairsArgs),

    /// Show what is cached
    Coverage(CoverageArgs),

    /// Check cached blocks against their checksums
    Verify(VerifyArgs),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

/// Optional JSON run file
///
/// ```json
/// { "symbols": ["ETHBTC", "LTCBTC"], "start": "2024-01-01", "end": "2024-03-31",
///   "cache_dir": "data/cache", "concurrency": 8 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunFile {
    /// Symbols to load
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Start date (YYYY-MM-DD or RFC3339)
    pub start: Option<String>,
    /// End date (YYYY-MM-DD inclusive, or RFC3339 exclusive)
    pub end: Option<String>,
    /// Cache root directory
    pub cache_dir: Option<PathBuf>,
    /// Concurrent exchange requests
    pub concurrency: Option<usize>,
}

impl RunFile {
    /// Read and parse a run file
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CliError::ConfigurationError(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            CliError::ConfigurationError(format!("Invalid run file {}: {e}", path.display()))
        })
    }
}

impl Cli {
    /// Run file named by `--config`, if any
    pub fn run_file(&self) -> Result<Option<RunFile>, CliError> {
        self.config.as_deref().map(RunFile::load).transpose()
    }

    /// Loader configuration; flags win over the run file
    pub fn loader_config(&self, run: Option<&RunFile>) -> Result<LoaderConfig, CliError> {
        if self.weight_per_minute < MIN_WEIGHT_PER_MINUTE {
            return Err(CliError::InvalidArgument(format!(
                "--weight-per-minute must be at least {MIN_WEIGHT_PER_MINUTE}"
            )));
        }

        let cache_dir = self
            .cache_dir
            .clone()
            .or_else(|| run.and_then(|r| r.cache_dir.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));

        let mut config = LoaderConfig::new(cache_dir)
            .with_timeframe(self.timeframe)
            .with_weight_per_minute(self.weight_per_minute)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_retry_policy(RetryPolicy::with_max_attempts(self.max_retries))
            .with_base_url(self.base_url.clone())
            .with_api_key(self.api_key.clone());

        let concurrency = match (self.concurrency, run.and_then(|r| r.concurrency)) {
            (Some(n), _) => Some(n),
            (None, Some(n)) => Some(parse_concurrency(&n.to_string()).map_err(CliError::ConfigurationError)?),
            (None, None) => None,
        };
        if let Some(n) = concurrency {
            config = config.with_max_concurrent_requests(n);
        }
        Ok(config)
    }
}

/// Parse the first millisecond of a range from YYYY-MM-DD or RFC3339
pub fn parse_start(input: &str) -> Result<i64, CliError> {
    parse_time(input, 0).map_err(|e| CliError::InvalidArgument(format!("Invalid start time '{input}': {e}")))
}

/// Parse the exclusive end of a range
///
/// A bare date includes that whole day, so the end is the next midnight.
pub fn parse_end(input: &str) -> Result<i64, CliError> {
    parse_time(input, 1).map_err(|e| CliError::InvalidArgument(format!("Invalid end time '{input}': {e}")))
}

fn parse_time(input: &str, date_offset_days: u64) -> Result<i64, String> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp_millis());
    }
    // No timezone designator: assume UTC
    if let Ok(dt) = DateTime::parse_from_rfc3339(&format!("{input}Z")) {
        return Ok(dt.timestamp_millis());
    }

    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|e| e.to_string())?;
    let date = date
        .checked_add_days(chrono::Days::new(date_offset_days))
        .ok_or_else(|| "date out of range".to_string())?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| "invalid date".to_string())?;
    Ok(midnight.and_utc().timestamp_millis())
}
