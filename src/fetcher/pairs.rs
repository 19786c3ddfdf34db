//! Trading-pair universe discovery
//!
//! Picks the most liquid symbols quoted in one asset from the 24h ticker
//! statistics: test and event listings are excluded, the rest ranked by quote
//! volume.

use serde_json::Value;
use tracing::{info, warn};

use crate::fetcher::binance_http::BinanceHttpClient;
use crate::fetcher::binance_parser::{BinanceParser, TickerStat};
use crate::fetcher::{FetchError, FetchResult};
use crate::loader::rate_limit::RateLimiter;
use crate::loader::retry::RetryPolicy;
use crate::metrics::record_retry_backoff;

/// Default quote asset
pub const DEFAULT_QUOTE_ASSET: &str = "BTC";

/// Default universe size
pub const DEFAULT_TOP_N: usize = 100;

/// Substrings marking listings that are not real markets
const EXCLUDED_MARKERS: [&str; 3] = ["TEST", "STUB", "EVENT"];

/// Rank `tickers` and return the top `top_n` symbols ending in `quote`
pub fn select_top_pairs(tickers: &[TickerStat], quote: &str, top_n: usize) -> Vec<String> {
    let quote = quote.to_ascii_uppercase();
    let mut candidates: Vec<&TickerStat> = tickers
        .iter()
        .filter(|t| t.symbol.len() > quote.len() && t.symbol.ends_with(&quote))
        .filter(|t| !EXCLUDED_MARKERS.iter().any(|m| t.symbol.contains(m)))
        .collect();

    // Highest volume first; ties broken by name for a stable universe
    candidates.sort_by(|a, b| {
        b.quote_volume
            .cmp(&a.quote_volume)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    candidates
        .into_iter()
        .take(top_n)
        .map(|t| t.symbol.clone())
        .collect()
}

/// Fetch 24h tickers and select the top `top_n` pairs quoted in `quote`
///
/// The ticker call takes its weight from `limiter` and is retried under
/// `retry` like any kline chunk.
pub async fn discover_pairs(
    client: &BinanceHttpClient,
    limiter: &RateLimiter,
    retry: &RetryPolicy,
    quote: &str,
    top_n: usize,
) -> FetchResult<Vec<String>> {
    let raw = fetch_tickers_with_retry(client, limiter, retry).await?;
    let tickers = BinanceParser::parse_tickers(&raw);
    let pairs = select_top_pairs(&tickers, quote, top_n);

    info!(
        quote = %quote,
        tickers = tickers.len(),
        selected = pairs.len(),
        "Selected trading pairs"
    );
    Ok(pairs)
}

async fn fetch_tickers_with_retry(
    client: &BinanceHttpClient,
    limiter: &RateLimiter,
    retry: &RetryPolicy,
) -> FetchResult<Vec<Value>> {
    // A bucket smaller than the ticker weight still admits it when full
    let weight = client.ticker_weight().min(limiter.capacity() as u32).max(1);

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        limiter
            .acquire(weight)
            .await
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        match client.fetch_tickers().await {
            Ok(raw) => {
                if attempt > 1 {
                    info!(attempt = attempt, "24h ticker fetch succeeded after retry");
                }
                return Ok(raw);
            }
            Err(err) if retry.should_retry(&err, attempt) => {
                let delay = retry.delay_for(attempt, err.retry_after());
                if let Some(retry_after) = err.retry_after() {
                    limiter.pause_for(retry_after).await;
                }
                warn!(
                    attempt = attempt,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "24h ticker fetch failed, retrying"
                );
                record_retry_backoff(delay, attempt);
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(attempt = attempt, error = %err, "24h ticker fetch failed");
                return Err(err);
            }
        }
    }
}
