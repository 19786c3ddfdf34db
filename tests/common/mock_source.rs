//! In-process kline source for exercising the loader without the network

use async_trait::async_trait;
use kline_cache::coverage::Interval;
use kline_cache::fetcher::{FetchError, FetchResult, KlineRequest, KlineSource};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const MIN: i64 = 60_000;

/// `[start_min, end_min)` in milliseconds
pub fn minutes(start_min: i64, end_min: i64) -> Interval {
    Interval::new(start_min * MIN, end_min * MIN).unwrap()
}

struct Failure {
    symbol: String,
    range: Option<Interval>,
    remaining: Option<u32>,
    error: FetchError,
}

/// Scriptable source serving synthetic one-minute bars
pub struct MockSource {
    max_limit: u32,
    delay: Duration,
    slow: Mutex<(u32, Duration)>,
    calls: AtomicUsize,
    requests: Mutex<Vec<KlineRequest>>,
    failures: Mutex<Vec<Failure>>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl MockSource {
    pub fn new() -> Self {
        Self {
            max_limit: 1000,
            delay: Duration::ZERO,
            slow: Mutex::new((0, Duration::ZERO)),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_limit(mut self, max_limit: u32) -> Self {
        self.max_limit = max_limit;
        self
    }

    /// Every call takes `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next `times` calls take `delay` on top of the base delay
    pub fn slow_times(self, times: u32, delay: Duration) -> Self {
        *self.slow.lock().unwrap() = (times, delay);
        self
    }

    /// Next `times` calls for `symbol` fail with `error`
    pub fn fail_times(self, symbol: &str, times: u32, error: FetchError) -> Self {
        self.push_failure(symbol, None, Some(times), error);
        self
    }

    /// Every call for `symbol` fails with `error`
    pub fn fail_always(self, symbol: &str, error: FetchError) -> Self {
        self.push_failure(symbol, None, None, error);
        self
    }

    /// Every call for `symbol` overlapping `range` fails with `error`
    pub fn fail_range(self, symbol: &str, range: Interval, error: FetchError) -> Self {
        self.push_failure(symbol, Some(range), None, error);
        self
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requested intervals in call order
    pub fn requested(&self) -> Vec<Interval> {
        self.requests.lock().unwrap().iter().map(|r| r.interval).collect()
    }

    /// Requested intervals of one symbol, sorted
    pub fn requested_for(&self, symbol: &str) -> Vec<Interval> {
        let mut intervals: Vec<Interval> = self
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.symbol == symbol)
            .map(|r| r.interval)
            .collect();
        intervals.sort();
        intervals
    }

    pub fn reset_log(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.requests.lock().unwrap().clear();
    }

    fn push_failure(&self, symbol: &str, range: Option<Interval>, remaining: Option<u32>, error: FetchError) {
        self.failures.lock().unwrap().push(Failure {
            symbol: symbol.to_string(),
            range,
            remaining,
            error,
        });
    }

    fn scripted_failure(&self, request: &KlineRequest) -> Option<FetchError> {
        let mut failures = self.failures.lock().unwrap();
        let failure = failures.iter_mut().find(|f| {
            f.symbol == request.symbol
                && f.range.map_or(true, |r| r.overlaps(&request.interval))
                && f.remaining != Some(0)
        })?;
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(failure.error.clone())
    }

    fn extra_delay(&self) -> Duration {
        let mut slow = self.slow.lock().unwrap();
        if slow.0 > 0 {
            slow.0 -= 1;
            slow.1
        } else {
            Duration::ZERO
        }
    }
}

/// Raw kline record for the bar opening at `open_time`
pub fn raw_kline(open_time: i64) -> Value {
    let minute = open_time / MIN;
    json!([
        open_time,
        format!("0.{:04}", 3000 + minute % 100),
        "0.3200",
        "0.2900",
        format!("0.{:04}", 3000 + (minute + 1) % 100),
        format!("{}.5", 10 + minute % 7),
        open_time + MIN - 1,
        "12.34",
        42,
        "1.0",
        "0.1",
        "0"
    ])
}

#[async_trait]
impl KlineSource for MockSource {
    async fn fetch_klines(&self, request: &KlineRequest) -> FetchResult<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let delay = self.delay + self.extra_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.scripted_failure(request) {
            return Err(error);
        }

        let step = request.timeframe.to_milliseconds();
        Ok((0..i64::from(request.limit))
            .map(|i| request.interval.start + i * step)
            .take_while(|t| *t < request.interval.end)
            .map(raw_kline)
            .collect())
    }

    fn max_limit(&self) -> u32 {
        self.max_limit
    }

    fn request_weight(&self) -> u32 {
        2
    }
}
