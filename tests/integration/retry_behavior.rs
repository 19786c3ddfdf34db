//! Retry, backoff and rate-limit handling at the fetcher level

use kline_cache::fetcher::{FetchError, Fetcher, KlineSource};
use kline_cache::loader::{RateLimiter, RetryPolicy};
use kline_cache::shutdown::ShutdownCoordinator;
use kline_cache::Timeframe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::common::mock_source::{minutes, MockSource};

fn fetcher(source: Arc<MockSource>, attempts: u32) -> Fetcher {
    Fetcher::new(source as Arc<dyn KlineSource>, Timeframe::OneMinute).with_retry_policy(
        RetryPolicy::with_max_attempts(attempts)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(0.0),
    )
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let source = Arc::new(MockSource::new().fail_times(
        "ETHBTC",
        2,
        FetchError::TransientNetwork("connection reset".to_string()),
    ));
    let fetcher = fetcher(source.clone(), 5);
    let cancel = ShutdownCoordinator::shared();

    let run = fetcher.fill_gap("ETHBTC", minutes(0, 30), &cancel).await.unwrap();
    assert_eq!(run.interval, minutes(0, 30));
    assert_eq!(run.bars.len(), 30);
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_report_the_last_cause() {
    let source = Arc::new(MockSource::new().fail_always(
        "ETHBTC",
        FetchError::TransientNetwork("connection reset".to_string()),
    ));
    let fetcher = fetcher(source.clone(), 3);
    let cancel = ShutdownCoordinator::shared();

    let err = fetcher.fill_gap("ETHBTC", minutes(0, 30), &cancel).await.unwrap_err();
    assert_eq!(source.calls(), 3);
    assert_eq!(err.failed_sub_interval, minutes(0, 30));
    assert!(err.fetched.is_empty());
    assert!(matches!(err.cause, FetchError::TransientNetwork(_)));
}

#[tokio::test]
async fn server_rate_limit_is_retried() {
    let source = Arc::new(MockSource::new().fail_times(
        "ETHBTC",
        1,
        FetchError::RateLimitExceeded {
            status: 429,
            retry_after: None,
        },
    ));
    let fetcher = fetcher(source.clone(), 5);
    let cancel = ShutdownCoordinator::shared();

    fetcher.fill_gap("ETHBTC", minutes(0, 10), &cancel).await.unwrap();
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_after_is_a_lower_bound_on_the_wait() {
    let source = Arc::new(MockSource::new().fail_times(
        "ETHBTC",
        1,
        FetchError::RateLimitExceeded {
            status: 429,
            retry_after: Some(Duration::from_secs(5)),
        },
    ));
    let fetcher = fetcher(source.clone(), 5);
    let cancel = ShutdownCoordinator::shared();

    let started = Instant::now();
    fetcher.fill_gap("ETHBTC", minutes(0, 10), &cancel).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempt_is_retried() {
    let source = Arc::new(MockSource::new().slow_times(1, Duration::from_secs(10)));
    let fetcher = fetcher(source.clone(), 5).with_request_timeout(Duration::from_secs(1));
    let cancel = ShutdownCoordinator::shared();

    let run = fetcher.fill_gap("ETHBTC", minutes(0, 10), &cancel).await.unwrap();
    assert_eq!(run.bars.len(), 10);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn invalid_request_fails_fast() {
    let source = Arc::new(MockSource::new().fail_always(
        "NOPEBTC",
        FetchError::InvalidRequest("Invalid symbol.".to_string()),
    ));
    let fetcher = fetcher(source.clone(), 5);
    let cancel = ShutdownCoordinator::shared();

    let err = fetcher.fill_gap("NOPEBTC", minutes(0, 10), &cancel).await.unwrap_err();
    assert_eq!(source.calls(), 1);
    assert!(matches!(err.cause, FetchError::InvalidRequest(_)));
}

#[tokio::test(start_paused = true)]
async fn limiter_spaces_requests_beyond_the_burst() {
    // Burst of 4 weight, refill 2 per second; each call costs 2
    let limiter = Arc::new(RateLimiter::new(4.0, 2.0));
    let source = Arc::new(MockSource::new().with_max_limit(10));
    let fetcher = fetcher(source.clone(), 1).with_rate_limiter(limiter);
    let cancel = ShutdownCoordinator::shared();

    let started = Instant::now();
    fetcher.fill_gap("ETHBTC", minutes(0, 40), &cancel).await.unwrap();

    assert_eq!(source.calls(), 4);
    // Two calls fit the burst; the other two wait for one second of refill each
    assert!(started.elapsed() >= Duration::from_secs(2));
}
