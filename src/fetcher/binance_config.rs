//! Binance spot market configuration
//!
//! Endpoint paths, request limits and weights for the public spot API. The
//! base URL is overridable so tests and mirrors can point elsewhere.

/// Configuration for the Binance spot market
///
/// # Rate Limit Weights
///
/// Each endpoint has an associated weight that must be passed to the rate limiter.
/// Binance enforces 6000 weight per minute per IP on the spot API; exceeding it
/// returns HTTP 429 and, if ignored, 418 with an IP ban.
#[derive(Debug, Clone)]
pub struct SpotMarketConfig {
    /// Base URL for API (e.g., <https://api.binance.com>)
    pub base_url: &'static str,

    /// Klines endpoint path
    pub klines_endpoint: &'static str,

    /// 24h ticker statistics endpoint path
    pub ticker_24hr_endpoint: &'static str,

    /// Maximum candles returned by one klines call
    pub klines_max_limit: u32,

    /// Rate limit weight for klines endpoint (limit 101..=1000)
    pub klines_weight: u32,

    /// Rate limit weight for the all-symbol 24h ticker call
    pub ticker_24hr_weight: u32,

    /// Weight budget per minute
    pub weight_per_minute: u32,
}

/// Binance spot API (<https://api.binance.com>, /api/v3/*)
pub const SPOT_CONFIG: SpotMarketConfig = SpotMarketConfig {
    base_url: "https://api.binance.com",
    klines_endpoint: "/api/v3/klines",
    ticker_24hr_endpoint: "/api/v3/ticker/24hr",
    klines_max_limit: 1000,
    klines_weight: 2,
    ticker_24hr_weight: 80,
    weight_per_minute: 6000,
};
