//! Command line parsing

use clap::Parser;
use kline_cache::cli::{Cli, CliError, Commands, OutputFormat, RunFile};
use kline_cache::Timeframe;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_fetch_symbols_are_comma_separated() {
    let cli = Cli::try_parse_from([
        "kline-cache",
        "fetch",
        "--symbols",
        "ETHBTC,LTCBTC,bnb/btc",
        "--start",
        "2024-01-01",
        "--end",
        "2024-01-31",
        "--export",
        "out.csv",
    ])
    .unwrap();

    match cli.command {
        Commands::Fetch(args) => {
            assert_eq!(args.symbols, vec!["ETHBTC", "LTCBTC", "bnb/btc"]);
            assert_eq!(args.start.as_deref(), Some("2024-01-01"));
            assert_eq!(args.end.as_deref(), Some("2024-01-31"));
            assert_eq!(args.export, Some(PathBuf::from("out.csv")));
            assert_eq!(args.quote, "BTC");
            assert!(args.top.is_none());
        }
        other => panic!("expected fetch, got {other:?}"),
    }
}

#[test]
fn test_top_conflicts_with_symbols() {
    let result = Cli::try_parse_from(["kline-cache", "fetch", "--symbols", "ETHBTC", "--top", "10"]);
    assert!(result.is_err());

    let cli = Cli::try_parse_from(["kline-cache", "fetch", "--top", "10", "--quote", "USDT"]).unwrap();
    match cli.command {
        Commands::Fetch(args) => {
            assert_eq!(args.top, Some(10));
            assert_eq!(args.quote, "USDT");
        }
        other => panic!("expected fetch, got {other:?}"),
    }
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from([
        "kline-cache",
        "coverage",
        "--symbol",
        "ETHBTC",
        "--output-format",
        "json",
        "--timeframe",
        "5m",
        "--cache-dir",
        "/tmp/klines",
    ])
    .unwrap();

    assert_eq!(cli.output_format, OutputFormat::Json);
    assert_eq!(cli.timeframe, Timeframe::FiveMinutes);
    assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/klines")));
    assert!(matches!(cli.command, Commands::Coverage(ref args) if args.symbol.as_deref() == Some("ETHBTC")));
}

#[test]
fn test_defaults() {
    let cli = Cli::try_parse_from(["kline-cache", "verify"]).unwrap();
    assert_eq!(cli.output_format, OutputFormat::Human);
    assert_eq!(cli.timeframe, Timeframe::OneMinute);
    assert_eq!(cli.max_retries, 5);
    assert_eq!(cli.request_timeout_secs, 30);
    assert_eq!(cli.weight_per_minute, 6000);
    assert_eq!(cli.base_url, "https://api.binance.com");
    assert!(cli.concurrency.is_none());

    let config = cli.loader_config(None).unwrap();
    assert_eq!(config.cache_dir, PathBuf::from("data/cache"));
    assert_eq!(config.max_concurrent_requests, 8);
}

#[test]
fn test_numeric_ranges_are_enforced() {
    for args in [
        ["kline-cache", "--max-retries", "0", "verify"],
        ["kline-cache", "--max-retries", "21", "verify"],
        ["kline-cache", "--concurrency", "33", "verify"],
        ["kline-cache", "--request-timeout-secs", "0", "verify"],
        ["kline-cache", "--timeframe", "7m", "verify"],
    ] {
        assert!(Cli::try_parse_from(args).is_err(), "accepted {args:?}");
    }
}

#[test]
fn test_run_file_load() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("run.json");
    std::fs::write(
        &path,
        r#"{"symbols": ["ETHBTC", "LTCBTC"], "start": "2024-01-01", "end": "2024-03-31", "concurrency": 4}"#,
    )
    .unwrap();

    let run = RunFile::load(&path).unwrap();
    assert_eq!(run.symbols, vec!["ETHBTC", "LTCBTC"]);
    assert_eq!(run.end.as_deref(), Some("2024-03-31"));
    assert_eq!(run.concurrency, Some(4));
    assert!(run.cache_dir.is_none());

    let cli = Cli::try_parse_from(["kline-cache", "--config", path.to_str().unwrap(), "verify"]).unwrap();
    assert_eq!(cli.run_file().unwrap(), Some(run));
}

#[test]
fn test_run_file_rejects_unknown_keys() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("run.json");
    std::fs::write(&path, r#"{"symbols": [], "interval": "1m"}"#).unwrap();

    assert!(matches!(RunFile::load(&path), Err(CliError::ConfigurationError(_))));
    assert!(matches!(
        RunFile::load(&temp.path().join("missing.json")),
        Err(CliError::ConfigurationError(_))
    ));
}
