//! Cache inspection commands: `coverage` and `verify`

use clap::Args;
use serde_json::json;
use tracing::{error, info};

use super::{Cli, CliError, OutputFormat};
use crate::cache::CacheManager;
use crate::normalize_symbol;

fn open_cache(cli: &Cli) -> Result<CacheManager, CliError> {
    let run = cli.run_file()?;
    let config = cli.loader_config(run.as_ref())?;
    Ok(CacheManager::new(&config.cache_dir, config.timeframe))
}

/// One symbol, or every cached symbol when none is given
async fn target_symbols(cache: &CacheManager, symbol: Option<&str>) -> Result<Vec<String>, CliError> {
    match symbol {
        Some(raw) => normalize_symbol(raw)
            .map(|s| vec![s])
            .ok_or_else(|| CliError::InvalidArgument(format!("invalid symbol '{raw}'"))),
        None => Ok(cache.symbols().await?),
    }
}

/// Arguments of `coverage`
#[derive(Args, Debug)]
pub struct CoverageArgs {
    /// Symbol to inspect (all cached symbols if omitted)
    #[arg(long)]
    pub symbol: Option<String>,
}

impl CoverageArgs {
    /// Print covered intervals and block counts
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let cache = open_cache(cli)?;
        let timeframe = cache.timeframe();
        let symbols = target_symbols(&cache, self.symbol.as_deref()).await?;

        let mut entries = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let record = cache.record(symbol).await?;
            let bars: usize = record.blocks().iter().map(|b| b.bars).sum();

            match cli.output_format {
                OutputFormat::Json => entries.push(json!({
                    "symbol": symbol,
                    "timeframe": timeframe.as_str(),
                    "intervals": record.coverage().intervals(),
                    "blocks": record.blocks().len(),
                    "bars": bars,
                })),
                OutputFormat::Human => {
                    println!(
                        "{symbol} {timeframe}: {} interval(s), {} block(s), {bars} bar(s)",
                        record.coverage().intervals().len(),
                        record.blocks().len()
                    );
                    for interval in record.coverage().intervals() {
                        println!("  {interval}");
                    }
                }
            }
        }

        if cli.output_format == OutputFormat::Json {
            println!("{}", json!({ "partitions": entries }));
        } else if symbols.is_empty() {
            println!("Cache at {} is empty", cache.root().display());
        }
        Ok(())
    }
}

/// Arguments of `verify`
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Symbol to verify (all cached symbols if omitted)
    #[arg(long)]
    pub symbol: Option<String>,
}

impl VerifyArgs {
    /// Check every block checksum; fails if any partition is corrupted
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let cache = open_cache(cli)?;
        let symbols = target_symbols(&cache, self.symbol.as_deref()).await?;

        let mut reports = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            reports.push(cache.verify(symbol).await?);
        }

        let failed = reports.iter().filter(|r| !r.is_ok()).count();
        match cli.output_format {
            OutputFormat::Json => {
                let entries: Vec<_> = reports
                    .iter()
                    .map(|r| {
                        json!({
                            "symbol": r.symbol,
                            "ok": r.is_ok(),
                            "blocks_checked": r.blocks_checked,
                            "failures": r.failures,
                            "orphans": r.orphans,
                        })
                    })
                    .collect();
                println!("{}", json!({ "partitions": entries }));
            }
            OutputFormat::Human => {
                for report in &reports {
                    let status = if report.is_ok() { "ok" } else { "CORRUPTED" };
                    println!(
                        "{:<12} {status} ({} block(s) checked)",
                        report.symbol, report.blocks_checked
                    );
                    for failure in &report.failures {
                        println!("  {failure}");
                    }
                    if !report.orphans.is_empty() {
                        println!("  {} unreferenced block file(s)", report.orphans.len());
                    }
                }
            }
        }

        if failed > 0 {
            error!(failed = failed, "Cache verification failed");
            return Err(CliError::VerifyFailed(failed));
        }
        info!(partitions = reports.len(), "Cache verification passed");
        Ok(())
    }
}
