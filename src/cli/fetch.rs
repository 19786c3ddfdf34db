//! Fetch command: fill the cache for a batch of symbols

use clap::Args;
use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{parse_end, parse_start, Cli, CliError, OutputFormat, RunFile};
use crate::coverage::Interval;
use crate::fetcher::binance_http::build_http_client;
use crate::fetcher::pairs::{discover_pairs, DEFAULT_QUOTE_ASSET};
use crate::fetcher::BinanceHttpClient;
use crate::loader::{DataLoader, LoadError, LoadSummary};
use crate::normalize_symbol;
use crate::output::csv::CsvExportWriter;
use crate::output::{BarsWriter, OutputWriter};
use crate::shutdown::SharedShutdown;
use crate::Timeframe;

/// Arguments of `fetch`
#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Symbols to load, comma separated (e.g. ETHBTC,LTCBTC)
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Load the top N pairs by 24h quote volume instead of a fixed list
    #[arg(long, conflicts_with = "symbols")]
    pub top: Option<usize>,

    /// Quote asset used with --top
    #[arg(long, default_value = DEFAULT_QUOTE_ASSET)]
    pub quote: String,

    /// Start time (YYYY-MM-DD or RFC3339)
    #[arg(long)]
    pub start: Option<String>,

    /// End time (YYYY-MM-DD inclusive, or RFC3339 exclusive)
    #[arg(long)]
    pub end: Option<String>,

    /// Write every loaded symbol's bars into one CSV file
    #[arg(long)]
    pub export: Option<PathBuf>,
}

impl FetchArgs {
    /// Run the batch
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let run = cli.run_file()?;
        let config = cli.loader_config(run.as_ref())?;
        let requested = self.requested_range(run.as_ref(), config.timeframe)?;
        let symbol_concurrency = config.symbol_concurrency;
        let loader = DataLoader::binance(config)?.with_shutdown(shutdown);
        let symbols = self.resolve_symbols(&loader, run.as_ref()).await?;

        info!(
            symbols = symbols.len(),
            requested = %requested,
            cache_dir = %loader.config().cache_dir.display(),
            "Starting batch fetch"
        );

        let progress = create_progress_bar(symbols.len());
        let mut results: Vec<(usize, String, Result<LoadSummary, LoadError>)> =
            stream::iter(symbols.into_iter().enumerate())
            .map(|(idx, symbol)| {
                let loader = &loader;
                let progress = &progress;
                async move {
                    let result = loader.ensure(&symbol, requested).await;
                    progress.set_message(symbol.clone());
                    progress.inc(1);
                    (idx, symbol, result)
                }
            })
            .buffer_unordered(symbol_concurrency.max(1))
            .collect()
            .await;
        progress.finish_and_clear();
        results.sort_by_key(|(idx, _, _)| *idx);

        let results: Vec<(String, Result<LoadSummary, LoadError>)> =
            results.into_iter().map(|(_, symbol, result)| (symbol, result)).collect();

        match cli.output_format {
            OutputFormat::Json => output_json(&requested, &results),
            OutputFormat::Human => output_human(&requested, &results),
        }

        if let Some(path) = &self.export {
            export(&loader, path, requested, &results).await?;
        }

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            return Err(CliError::SymbolsFailed {
                failed,
                total: results.len(),
            });
        }
        Ok(())
    }

    fn requested_range(&self, run: Option<&RunFile>, timeframe: Timeframe) -> Result<Interval, CliError> {
        let start = self
            .start
            .as_deref()
            .or_else(|| run.and_then(|r| r.start.as_deref()))
            .ok_or_else(|| CliError::InvalidArgument("--start is required".to_string()))?;
        let end = self
            .end
            .as_deref()
            .or_else(|| run.and_then(|r| r.end.as_deref()))
            .ok_or_else(|| CliError::InvalidArgument("--end is required".to_string()))?;

        let requested = Interval::new(parse_start(start)?, parse_end(end)?)
            .map_err(|e| CliError::InvalidArgument(e.to_string()))?;
        if !requested.is_aligned(timeframe) {
            return Err(CliError::InvalidArgument(format!(
                "range {requested} is not aligned to {timeframe}"
            )));
        }
        Ok(requested)
    }

    async fn resolve_symbols(&self, loader: &DataLoader, run: Option<&RunFile>) -> Result<Vec<String>, CliError> {
        let raw: Vec<String> = if let Some(top) = self.top {
            let config = loader.config();
            let client = build_http_client(config.request_timeout)?;
            let mut source = BinanceHttpClient::new(client, config.base_url.clone());
            if let Some(api_key) = &config.api_key {
                source = source.with_api_key(api_key.clone());
            }
            discover_pairs(&source, loader.rate_limiter(), &config.retry, &self.quote, top).await?
        } else if !self.symbols.is_empty() {
            self.symbols.clone()
        } else {
            run.map(|r| r.symbols.clone()).unwrap_or_default()
        };

        let mut symbols: Vec<String> = Vec::with_capacity(raw.len());
        for symbol in &raw {
            let normalized = normalize_symbol(symbol)
                .ok_or_else(|| CliError::InvalidArgument(format!("invalid symbol '{symbol}'")))?;
            if !symbols.contains(&normalized) {
                symbols.push(normalized);
            }
        }

        if symbols.is_empty() {
            return Err(CliError::InvalidArgument(
                "no symbols given (use --symbols, --top or a run file)".to_string(),
            ));
        }
        Ok(symbols)
    }
}

fn create_progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} symbols ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn output_json(requested: &Interval, results: &[(String, Result<LoadSummary, LoadError>)]) {
    let symbols: Vec<_> = results
        .iter()
        .map(|(symbol, result)| match result {
            Ok(summary) => json!({
                "symbol": symbol,
                "success": true,
                "gaps": summary.gaps.len(),
                "committed_bars": summary.committed_bars,
            }),
            Err(e) => json!({
                "symbol": symbol,
                "success": false,
                "missing": e.missing(),
                "error": e.to_string(),
            }),
        })
        .collect();

    let output = json!({
        "start": requested.start,
        "end": requested.end,
        "symbols": symbols,
    });
    println!("{output}");
}

fn output_human(requested: &Interval, results: &[(String, Result<LoadSummary, LoadError>)]) {
    let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
    println!("\nFetched {requested}: {ok}/{} symbol(s) complete", results.len());

    for (symbol, result) in results {
        match result {
            Ok(summary) if summary.gaps.is_empty() => println!("  {symbol:<12} cached"),
            Ok(summary) => println!(
                "  {symbol:<12} filled {} gap(s), {} new bar(s)",
                summary.gaps.len(),
                summary.committed_bars
            ),
            Err(e) => eprintln!("  {symbol:<12} FAILED: {e}"),
        }
    }
}

async fn export(
    loader: &DataLoader,
    path: &Path,
    requested: Interval,
    results: &[(String, Result<LoadSummary, LoadError>)],
) -> Result<(), CliError> {
    let mut writer = CsvExportWriter::new(path)?;
    for (symbol, result) in results {
        if result.is_err() {
            warn!(symbol = %symbol, "Skipping incomplete symbol in export");
            continue;
        }
        let bars = loader.cache().read(symbol, requested).await?;
        writer.write_bars(symbol, &bars)?;
    }
    let rows = writer.bars_written();
    writer.close()?;
    info!(path = %path.display(), rows = rows, "Export written");
    Ok(())
}
