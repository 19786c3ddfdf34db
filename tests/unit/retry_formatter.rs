use std::time::Duration;

use kline_cache::coverage::Interval;
use kline_cache::fetcher::retry_formatter::{RetryContext, RetryErrorType};
use kline_cache::fetcher::FetchError;

fn chunk() -> Interval {
    // 2023-12-04 05:20 to 2023-12-05 04:00 UTC
    Interval::new(1_701_667_200_000, 1_701_748_800_000).unwrap()
}

fn sample_context(error: &FetchError) -> RetryContext {
    RetryContext::new(2, 5, error, Duration::from_secs(4), "ETHBTC", chunk())
}

#[test]
fn format_retry_captures_attempt_and_wait() {
    let err = FetchError::RateLimitExceeded {
        status: 429,
        retry_after: Some(Duration::from_secs(4)),
    };
    let message = sample_context(&err).format_retry();
    assert!(message.contains("attempt 3/5"));
    assert!(message.contains("rate limit exceeded"));
    assert!(message.contains("4.0 seconds"));
    assert!(message.contains("ETHBTC"));
    assert!(message.contains("2023-12-04"));
}

#[test]
fn format_success_includes_symbol_context() {
    let err = FetchError::Timeout(Duration::from_secs(30));
    let message = sample_context(&err).format_success();
    assert!(message.contains("Retry attempt 2/5 succeeded"));
    assert!(message.contains("ETHBTC"));
}

#[test]
fn format_failure_lists_suggestions() {
    let err = FetchError::TransientNetwork("server error 502 Bad Gateway: ".to_string());
    let output = sample_context(&err).format_failure();
    assert!(output.contains("Chunk failed after 2 attempt(s)"));
    assert!(output.contains("502 Bad Gateway"));
    assert!(output.contains("Exchange may be experiencing issues"));
    assert_eq!(output.lines().count(), 5);
}

#[test]
fn error_types_are_classified() {
    let cases = [
        (FetchError::Timeout(Duration::from_secs(1)), RetryErrorType::NetworkTimeout),
        (
            FetchError::TransientNetwork("/api/v3/klines: timeout: operation timed out".into()),
            RetryErrorType::NetworkTimeout,
        ),
        (FetchError::TransientNetwork("connection refused".into()), RetryErrorType::NetworkGeneric),
        (
            FetchError::RateLimitExceeded {
                status: 429,
                retry_after: None,
            },
            RetryErrorType::RateLimit,
        ),
        (
            FetchError::RateLimitExceeded {
                status: 418,
                retry_after: None,
            },
            RetryErrorType::IpBanned,
        ),
        (FetchError::InvalidRequest("bad".into()), RetryErrorType::InvalidRequest),
        (FetchError::integrity(0, "gap"), RetryErrorType::DataIntegrity),
        (FetchError::Cancelled, RetryErrorType::Cancelled),
    ];

    for (error, expected) in cases {
        assert_eq!(RetryErrorType::from_error(&error), expected, "{error}");
    }
}

#[test]
fn rate_limit_suggestion_names_the_knobs() {
    assert!(RetryErrorType::RateLimit.suggestion().contains("--concurrency"));
    assert!(RetryErrorType::IpBanned.suggestion().contains("--weight-per-minute"));
    assert!(RetryErrorType::NetworkTimeout
        .suggestion()
        .contains("--request-timeout-secs"));
}
