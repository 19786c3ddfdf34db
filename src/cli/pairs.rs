//! Pairs command: show the trading-pair universe

use clap::Args;
use serde_json::json;

use super::{Cli, CliError, OutputFormat};
use crate::fetcher::binance_http::build_http_client;
use crate::fetcher::pairs::{discover_pairs, DEFAULT_QUOTE_ASSET, DEFAULT_TOP_N};
use crate::fetcher::BinanceHttpClient;
use crate::loader::rate_limit::RateLimiter;

/// Arguments of `pairs`
#[derive(Args, Debug)]
pub struct PairsArgs {
    /// Quote asset the pairs must end in
    #[arg(long, default_value = DEFAULT_QUOTE_ASSET)]
    pub quote: String,

    /// Number of pairs to keep, by 24h quote volume
    #[arg(long, default_value_t = DEFAULT_TOP_N)]
    pub top: usize,
}

impl PairsArgs {
    /// Fetch 24h statistics and print the selected pairs
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let config = cli.loader_config(None)?;
        let client = build_http_client(config.request_timeout)?;
        let mut source = BinanceHttpClient::new(client, config.base_url.clone());
        if let Some(api_key) = &config.api_key {
            source = source.with_api_key(api_key.clone());
        }
        let limiter = RateLimiter::weight_per_minute(config.weight_per_minute);

        let pairs = discover_pairs(&source, &limiter, &config.retry, &self.quote, self.top).await?;

        match cli.output_format {
            OutputFormat::Json => {
                println!("{}", json!({ "quote": self.quote.to_ascii_uppercase(), "pairs": pairs }));
            }
            OutputFormat::Human => {
                println!("Top {} pairs quoted in {}:", pairs.len(), self.quote.to_ascii_uppercase());
                for (rank, symbol) in pairs.iter().enumerate() {
                    println!("  {:>3}. {symbol}", rank + 1);
                }
            }
        }
        Ok(())
    }
}
