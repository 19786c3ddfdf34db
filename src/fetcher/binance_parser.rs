//! Binance response parser
//!
//! Stateless functions turning raw JSON payloads into validated, typed values.
//! Parsing is eager: the first invalid record fails the whole payload with a
//! [`FetchError::DataIntegrity`] naming its timestamp.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::fetcher::{FetchError, FetchResult};
use crate::{Bar, Timeframe};

/// Minimum number of fields in a kline record
const KLINE_MIN_FIELDS: usize = 6;

/// 24h ticker statistics relevant to pair selection
#[derive(Debug, Clone, PartialEq)]
pub struct TickerStat {
    /// Exchange symbol
    pub symbol: String,
    /// 24h traded volume in the quote asset
    pub quote_volume: Decimal,
}

/// Stateless parser for Binance API responses
pub struct BinanceParser;

impl BinanceParser {
    /// Parse Binance klines JSON array to an ordered, contiguous bar series
    ///
    /// # Format
    /// `[open_time, open, high, low, close, volume, close_time, ...]`; trailing
    /// fields are ignored. Numeric fields may be JSON strings or numbers.
    ///
    /// # Errors
    /// `DataIntegrity` if a record is malformed, a price relation is violated,
    /// a timestamp is misaligned, or consecutive timestamps are not exactly one
    /// timeframe apart (a missing minute is never interpolated).
    pub fn parse_klines(raw: &[Value], symbol: &str, timeframe: Timeframe) -> FetchResult<Vec<Bar>> {
        let step = timeframe.to_milliseconds();
        let mut bars: Vec<Bar> = Vec::with_capacity(raw.len());

        for (index, record) in raw.iter().enumerate() {
            let bar = Self::parse_kline(record, index, symbol)?;

            if !timeframe.is_aligned(bar.open_time) {
                return Err(FetchError::integrity(
                    bar.open_time,
                    format!("{symbol}: open time not aligned to {timeframe}"),
                ));
            }

            if let Some(prev) = bars.last() {
                let delta = bar.open_time - prev.open_time;
                if delta <= 0 {
                    return Err(FetchError::integrity(
                        bar.open_time,
                        format!(
                            "{symbol}: timestamps not strictly increasing (previous {})",
                            prev.open_time
                        ),
                    ));
                }
                if delta != step {
                    return Err(FetchError::integrity(
                        bar.open_time,
                        format!(
                            "{symbol}: {} missing bar(s) after {}",
                            delta / step - 1,
                            prev.open_time
                        ),
                    ));
                }
            }

            bars.push(bar);
        }

        Ok(bars)
    }

    fn parse_kline(record: &Value, index: usize, symbol: &str) -> FetchResult<Bar> {
        let arr = record.as_array().ok_or_else(|| {
            FetchError::integrity(None, format!("{symbol}: record {index} is not an array"))
        })?;

        let open_time = arr
            .first()
            .and_then(Self::parse_timestamp)
            .ok_or_else(|| {
                FetchError::integrity(None, format!("{symbol}: record {index} has invalid open time"))
            })?;

        if arr.len() < KLINE_MIN_FIELDS {
            return Err(FetchError::integrity(
                open_time,
                format!(
                    "{symbol}: expected at least {KLINE_MIN_FIELDS} fields, got {}",
                    arr.len()
                ),
            ));
        }

        let field = |idx: usize, name: &str| -> FetchResult<Decimal> {
            let value = Self::parse_decimal(&arr[idx], name)
                .map_err(|msg| FetchError::integrity(open_time, format!("{symbol}: {msg}")))?;
            if value.is_sign_negative() && !value.is_zero() {
                return Err(FetchError::integrity(
                    open_time,
                    format!("{symbol}: {name} is negative ({value})"),
                ));
            }
            Ok(value)
        };

        let bar = Bar {
            open_time,
            open: field(1, "open")?,
            high: field(2, "high")?,
            low: field(3, "low")?,
            close: field(4, "close")?,
            volume: field(5, "volume")?,
        };

        bar.validate()
            .map_err(|msg| FetchError::integrity(open_time, format!("{symbol}: {msg}")))?;

        Ok(bar)
    }

    /// Parse decimal from a JSON string or number
    ///
    /// Accepts plain and scientific notation ("0.00001", "1e-5", 12.5).
    pub fn parse_decimal(value: &Value, field_name: &str) -> Result<Decimal, String> {
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            other => return Err(format!("{field_name} is not numeric: {other}")),
        };

        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|e| format!("Failed to parse {field_name} '{text}': {e}"))
    }

    fn parse_timestamp(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Parse the `/ticker/24hr` array, skipping entries without a usable volume
    pub fn parse_tickers(raw: &[Value]) -> Vec<TickerStat> {
        raw.iter()
            .filter_map(|entry| {
                let symbol = entry.get("symbol")?.as_str()?.to_string();
                let quote_volume = Self::parse_decimal(entry.get("quoteVolume")?, "quoteVolume").ok()?;
                Some(TickerStat {
                    symbol,
                    quote_volume,
                })
            })
            .collect()
    }
}
