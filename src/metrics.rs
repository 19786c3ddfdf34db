//! Observability metrics for kline loading
//!
//! Counters for kline requests, retries and rate-limit rejections, cache
//! hits/misses and committed bars; histograms for request latency and backoff;
//! gauges for limiter tokens and the exchange-reported used weight.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Prometheus exporter only when an address is configured
//! - Emitting without an installed recorder is a no-op

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Metrics registry initialization flag
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Correlation ID generator for request tracing
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize metrics system with Prometheus exporter
///
/// Must be called from within a tokio runtime. Idempotent: later calls are
/// ignored.
///
/// # Arguments
/// * `addr` - Socket address to bind Prometheus scrape endpoint (e.g., "0.0.0.0:9090")
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        METRICS_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(format!("Failed to install Prometheus exporter: {e}").into());
    }

    describe_counter!(
        "kline_requests_total",
        Unit::Count,
        "Total number of kline HTTP requests made to the exchange"
    );
    describe_counter!(
        "kline_rate_limited_total",
        Unit::Count,
        "Total number of 429/418 responses received"
    );
    describe_counter!(
        "kline_retries_total",
        Unit::Count,
        "Total number of retry attempts"
    );
    describe_histogram!(
        "kline_request_duration_seconds",
        Unit::Seconds,
        "HTTP request duration in seconds"
    );
    describe_histogram!(
        "kline_retry_backoff_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );
    describe_gauge!(
        "exchange_used_weight",
        Unit::Count,
        "Weight used in the current minute as reported by the exchange"
    );
    describe_gauge!(
        "rate_limiter_tokens_available",
        Unit::Count,
        "Tokens left in the shared bucket after the last acquisition"
    );
    describe_histogram!(
        "rate_limiter_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for rate limiter tokens"
    );
    describe_counter!(
        "cache_hits_total",
        Unit::Count,
        "Loads served entirely from the local cache"
    );
    describe_counter!(
        "cache_misses_total",
        Unit::Count,
        "Loads that needed at least one fetch"
    );
    describe_counter!(
        "cache_committed_bars_total",
        Unit::Count,
        "Bars durably committed to the cache"
    );
    describe_counter!(
        "loads_completed_total",
        Unit::Count,
        "Total number of successful loads"
    );
    describe_counter!(
        "loads_failed_total",
        Unit::Count,
        "Total number of failed loads"
    );

    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Whether the Prometheus exporter has been installed
pub fn is_initialized() -> bool {
    METRICS_INITIALIZED.load(Ordering::SeqCst)
}

/// Generate a new correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{:08x}", id)
}

/// Timing and outcome of one HTTP request
pub struct HttpRequestMetrics {
    endpoint: String,
    start_time: Instant,
    correlation_id: String,
}

impl HttpRequestMetrics {
    /// Start recording a new HTTP request
    pub fn start(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let correlation_id = generate_correlation_id();

        debug!(
            correlation_id = %correlation_id,
            endpoint = %endpoint,
            "Starting HTTP request"
        );

        Self {
            endpoint,
            start_time: Instant::now(),
            correlation_id,
        }
    }

    /// Record completion with a status label ("200", "429", "error", ...)
    pub fn record(&self, status: &str) {
        let duration = self.start_time.elapsed();

        counter!(
            "kline_requests_total",
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string(),
        )
        .increment(1);

        histogram!(
            "kline_request_duration_seconds",
            "endpoint" => self.endpoint.clone(),
        )
        .record(duration.as_secs_f64());

        if status == "429" || status == "418" {
            counter!(
                "kline_rate_limited_total",
                "endpoint" => self.endpoint.clone(),
            )
            .increment(1);
        }

        debug!(
            correlation_id = %self.correlation_id,
            endpoint = %self.endpoint,
            status = status,
            duration_ms = duration.as_millis(),
            "HTTP request completed"
        );
    }

    /// Correlation ID for this request
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Record retry backoff duration
pub fn record_retry_backoff(duration: Duration, attempt: u32) {
    counter!(
        "kline_retries_total",
        "attempt" => attempt.to_string(),
    )
    .increment(1);

    histogram!("kline_retry_backoff_seconds").record(duration.as_secs_f64());

    debug!(
        attempt = attempt,
        backoff_ms = duration.as_millis(),
        "Retry backoff recorded"
    );
}

/// Record the used weight reported in `X-MBX-USED-WEIGHT-1M`
pub fn record_used_weight(used: u32) {
    gauge!("exchange_used_weight").set(used as f64);
    debug!(used_weight = used, "Exchange weight recorded");
}

/// Record a completed limiter acquisition
pub fn record_limiter_acquired(wait: Duration, tokens_left: f64) {
    histogram!("rate_limiter_wait_seconds").record(wait.as_secs_f64());
    gauge!("rate_limiter_tokens_available").set(tokens_left);

    if wait.as_millis() > 100 {
        debug!(
            wait_ms = wait.as_millis(),
            tokens_left = tokens_left,
            "Rate limit tokens acquired after wait"
        );
    }
}

/// Record whether a load needed the network
pub fn record_cache_lookup(symbol: &str, gap_count: usize) {
    if gap_count == 0 {
        counter!("cache_hits_total", "symbol" => symbol.to_string()).increment(1);
    } else {
        counter!("cache_misses_total", "symbol" => symbol.to_string()).increment(1);
    }
}

/// Record bars committed for a symbol
pub fn record_committed_bars(symbol: &str, bars: usize) {
    counter!("cache_committed_bars_total", "symbol" => symbol.to_string()).increment(bars as u64);
}

/// Per-symbol load tracking
pub struct LoadMetrics {
    symbol: String,
    start_time: Instant,
}

impl LoadMetrics {
    /// Start tracking a load
    pub fn start(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            start_time: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn record_success(&self, bars: usize) {
        counter!("loads_completed_total", "symbol" => self.symbol.clone()).increment(1);

        info!(
            symbol = %self.symbol,
            bars = bars,
            duration_ms = self.start_time.elapsed().as_millis(),
            "Load completed"
        );
    }

    /// Record failure
    pub fn record_failure(&self, error: &str) {
        counter!("loads_failed_total", "symbol" => self.symbol.clone()).increment(1);

        error!(
            symbol = %self.symbol,
            error = %error,
            duration_ms = self.start_time.elapsed().as_millis(),
            "Load failed"
        );
    }

    /// Record a cancelled load
    pub fn record_cancelled(&self) {
        warn!(
            symbol = %self.symbol,
            duration_ms = self.start_time.elapsed().as_millis(),
            "Load cancelled"
        );
    }
}
