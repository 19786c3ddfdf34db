//! Cancelling a load keeps everything already committed

use kline_cache::fetcher::{FetchError, Fetcher, KlineSource};
use kline_cache::loader::{DataLoader, LoadError, RetryPolicy};
use kline_cache::shutdown::ShutdownCoordinator;
use kline_cache::Timeframe;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::common::harness::{fast_config, loader_with};
use crate::common::mock_source::{minutes, MockSource};

#[tokio::test]
async fn dropped_get_still_commits_in_flight_chunks() {
    let temp = TempDir::new().unwrap();
    let source = MockSource::new()
        .with_max_limit(10)
        .with_delay(Duration::from_millis(300));
    let (loader, source) = loader_with(temp.path(), source);

    let outcome = tokio::time::timeout(Duration::from_millis(80), loader.get("ETHBTC", minutes(0, 30))).await;
    assert!(outcome.is_err(), "get should still be running");

    // The requests were already sent; their results land in the cache
    let mut coverage = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        coverage = loader.cache().coverage("ETHBTC").await.unwrap().intervals().to_vec();
        if coverage == vec![minutes(0, 30)] {
            break;
        }
    }
    assert_eq!(coverage, vec![minutes(0, 30)]);
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn cancelled_parent_stops_before_any_request() {
    let temp = TempDir::new().unwrap();
    let parent = ShutdownCoordinator::shared();
    parent.request_shutdown();

    let source = Arc::new(MockSource::new());
    let loader = DataLoader::new(fast_config(temp.path()), source.clone()).with_shutdown(parent);

    match loader.get("ETHBTC", minutes(0, 30)).await {
        Err(LoadError::Cancelled { symbol, missing }) => {
            assert_eq!(symbol, "ETHBTC");
            assert_eq!(missing, vec![minutes(0, 30)]);
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn cancel_during_backoff_stops_retrying() {
    let source = Arc::new(MockSource::new().fail_always(
        "ETHBTC",
        FetchError::TransientNetwork("connection reset".to_string()),
    ));
    let fetcher = Fetcher::new(source.clone() as Arc<dyn KlineSource>, Timeframe::OneMinute)
        .with_retry_policy(RetryPolicy::with_max_attempts(10).with_delays(Duration::from_secs(60), Duration::from_secs(60)));
    let cancel = ShutdownCoordinator::shared();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.request_shutdown();
        })
    };

    let err = fetcher.fill_gap("ETHBTC", minutes(0, 10), &cancel).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err.cause, FetchError::Cancelled));
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn parent_cancel_reaches_every_symbol() {
    let temp = TempDir::new().unwrap();
    let parent = ShutdownCoordinator::shared();
    let source = Arc::new(MockSource::new().fail_always(
        "BBBBTC",
        FetchError::TransientNetwork("connection reset".to_string()),
    ));
    let config = fast_config(temp.path()).with_retry_policy(
        RetryPolicy::with_max_attempts(10).with_delays(Duration::from_secs(60), Duration::from_secs(60)),
    );
    let loader = DataLoader::new(config, source.clone()).with_shutdown(parent.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        parent.request_shutdown();
    });

    let results = loader.get_many(&["AAABTC", "BBBBTC"], minutes(0, 10)).await;
    canceller.await.unwrap();

    assert_eq!(results[0].1.as_ref().unwrap().len(), 10);
    assert!(matches!(results[1].1, Err(LoadError::Cancelled { .. })));
}

#[tokio::test]
async fn sibling_loads_survive_a_dropped_get() {
    let temp = TempDir::new().unwrap();
    let (loader, _) = loader_with(temp.path(), MockSource::new().with_delay(Duration::from_millis(50)));

    let dropped = tokio::time::timeout(Duration::from_millis(10), loader.get("ETHBTC", minutes(0, 10))).await;
    assert!(dropped.is_err());

    let bars = loader.get("LTCBTC", minutes(0, 10)).await.unwrap();
    assert_eq!(bars.len(), 10);
}

#[tokio::test]
async fn dropped_fill_releases_its_pool_slot() {
    let source = Arc::new(MockSource::new().with_delay(Duration::from_millis(200)));
    let fetcher = Fetcher::new(source.clone() as Arc<dyn KlineSource>, Timeframe::OneMinute)
        .with_max_concurrent_requests(1);
    let cancel = ShutdownCoordinator::shared();

    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        fetcher.fill_gap("ETHBTC", minutes(0, 10), &cancel),
    )
    .await;
    assert!(dropped.is_err(), "first fill should still be in flight");

    // The abandoned request finishes on its own and frees the only slot
    let second = tokio::time::timeout(
        Duration::from_secs(2),
        fetcher.fill_gap("LTCBTC", minutes(0, 10), &cancel),
    )
    .await
    .expect("second fill hung behind the dropped one")
    .unwrap();
    assert_eq!(second.bars.len(), 10);

    // Nothing stale is left to join
    fetcher.fill_gap("ETHBTC", minutes(0, 10), &cancel).await.unwrap();
    assert_eq!(source.calls(), 3);
}
