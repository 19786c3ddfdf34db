//! Unit tests for BinanceParser and pair selection

use kline_cache::fetcher::binance_parser::BinanceParser;
use kline_cache::fetcher::pairs::select_top_pairs;
use kline_cache::fetcher::FetchError;
use kline_cache::Timeframe;
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;

use crate::common::mock_source::{raw_kline, MIN};

const T0: i64 = 1_704_067_200_000;

#[test]
fn test_parse_full_binance_records() {
    let raw: Vec<_> = (0..5).map(|i| raw_kline(T0 + i * MIN)).collect();
    let bars = BinanceParser::parse_klines(&raw, "ETHBTC", Timeframe::OneMinute).unwrap();

    assert_eq!(bars.len(), 5);
    for (i, bar) in bars.iter().enumerate() {
        assert_eq!(bar.open_time, T0 + i as i64 * MIN);
        assert!(bar.high >= bar.open && bar.high >= bar.close);
        assert!(bar.low <= bar.open && bar.low <= bar.close);
    }
}

#[test]
fn test_empty_payload_parses_to_no_bars() {
    let bars = BinanceParser::parse_klines(&[], "ETHBTC", Timeframe::OneMinute).unwrap();
    assert!(bars.is_empty());
}

#[test]
fn test_missing_minute_is_rejected_not_interpolated() {
    let raw = vec![raw_kline(T0), raw_kline(T0 + MIN), raw_kline(T0 + 4 * MIN)];
    let err = BinanceParser::parse_klines(&raw, "ETHBTC", Timeframe::OneMinute).unwrap_err();

    match err {
        FetchError::DataIntegrity { timestamp, message } => {
            assert_eq!(timestamp, Some(T0 + 4 * MIN));
            assert!(message.contains("2 missing bar(s)"), "{message}");
        }
        other => panic!("expected DataIntegrity, got {other:?}"),
    }
}

#[test]
fn test_duplicate_timestamp_is_rejected() {
    let raw = vec![raw_kline(T0), raw_kline(T0)];
    let err = BinanceParser::parse_klines(&raw, "ETHBTC", Timeframe::OneMinute).unwrap_err();
    assert!(matches!(err, FetchError::DataIntegrity { timestamp: Some(t), .. } if t == T0));
}

#[test]
fn test_misaligned_open_time_is_rejected() {
    let raw = vec![raw_kline(T0 + 1_000)];
    assert!(BinanceParser::parse_klines(&raw, "ETHBTC", Timeframe::OneMinute).is_err());
}

#[test]
fn test_price_relations_are_checked() {
    // high below low
    let raw = vec![json!([T0, "0.05", "0.04", "0.06", "0.05", "1.0", T0 + MIN - 1])];
    let err = BinanceParser::parse_klines(&raw, "ETHBTC", Timeframe::OneMinute).unwrap_err();
    assert!(matches!(err, FetchError::DataIntegrity { timestamp: Some(t), .. } if t == T0));

    // negative volume
    let raw = vec![json!([T0, "0.05", "0.06", "0.04", "0.05", "-1.0", T0 + MIN - 1])];
    assert!(BinanceParser::parse_klines(&raw, "ETHBTC", Timeframe::OneMinute).is_err());
}

#[test]
fn test_malformed_records_are_rejected() {
    let cases = vec![
        json!("not an array"),
        json!([T0, "0.05", "0.06"]),
        json!([T0, "abc", "0.06", "0.04", "0.05", "1.0"]),
        json!([null, "0.05", "0.06", "0.04", "0.05", "1.0"]),
    ];
    for case in cases {
        let result = BinanceParser::parse_klines(&[case.clone()], "ETHBTC", Timeframe::OneMinute);
        assert!(
            matches!(result, Err(FetchError::DataIntegrity { .. })),
            "accepted {case}"
        );
    }
}

#[test]
fn test_parse_decimal_forms() {
    assert_eq!(
        BinanceParser::parse_decimal(&json!("0.00001"), "open").unwrap(),
        Decimal::from_str("0.00001").unwrap()
    );
    assert_eq!(
        BinanceParser::parse_decimal(&json!("1e-5"), "open").unwrap(),
        Decimal::from_str("0.00001").unwrap()
    );
    assert_eq!(
        BinanceParser::parse_decimal(&json!(12.5), "open").unwrap(),
        Decimal::from_str("12.5").unwrap()
    );
    assert!(BinanceParser::parse_decimal(&json!(true), "open").is_err());
}

#[test]
fn test_tickers_to_top_pairs() {
    let raw = vec![
        json!({"symbol": "ETHBTC", "quoteVolume": "2500.5"}),
        json!({"symbol": "LTCBTC", "quoteVolume": "310.0"}),
        json!({"symbol": "BNBBTC", "quoteVolume": "980.25"}),
        json!({"symbol": "BTCUSDT", "quoteVolume": "99999999"}),
        json!({"symbol": "TESTBTC", "quoteVolume": "50000"}),
        json!({"symbol": "XRPBTC"}),
    ];

    let tickers = BinanceParser::parse_tickers(&raw);
    assert_eq!(tickers.len(), 5);

    let pairs = select_top_pairs(&tickers, "btc", 3);
    assert_eq!(pairs, vec!["ETHBTC", "BNBBTC", "LTCBTC"]);
}
