//! Concurrent requests for the same bars share exchange calls

use kline_cache::fetcher::{Fetcher, KlineSource};
use kline_cache::shutdown::ShutdownCoordinator;
use kline_cache::Timeframe;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::common::harness::loader_with;
use crate::common::mock_source::{minutes, MockSource, MIN};

#[tokio::test]
async fn identical_chunks_are_fetched_once() {
    let source = Arc::new(MockSource::new().with_delay(Duration::from_millis(20)));
    let fetcher = Fetcher::new(source.clone() as Arc<dyn KlineSource>, Timeframe::OneMinute);
    let cancel = ShutdownCoordinator::shared();

    let (a, b) = tokio::join!(
        fetcher.fill_gap("ETHBTC", minutes(0, 60), &cancel),
        fetcher.fill_gap("ETHBTC", minutes(0, 60), &cancel),
    );

    assert_eq!(a.unwrap().bars, b.unwrap().bars);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn contained_chunk_joins_the_wider_request() {
    let source = Arc::new(MockSource::new().with_delay(Duration::from_millis(20)));
    let fetcher = Fetcher::new(source.clone() as Arc<dyn KlineSource>, Timeframe::OneMinute);
    let cancel = ShutdownCoordinator::shared();

    let (wide, narrow) = tokio::join!(
        fetcher.fill_gap("ETHBTC", minutes(0, 1000), &cancel),
        fetcher.fill_gap("ETHBTC", minutes(100, 200), &cancel),
    );

    let narrow = narrow.unwrap();
    assert_eq!(wide.unwrap().bars.len(), 1000);
    assert_eq!(narrow.interval, minutes(100, 200));
    assert_eq!(narrow.bars.len(), 100);
    assert_eq!(narrow.bars[0].open_time, 100 * MIN);
    assert_eq!(source.calls(), 1);
    assert_eq!(source.requested(), vec![minutes(0, 1000)]);
}

#[tokio::test]
async fn other_symbols_are_not_joined() {
    let source = Arc::new(MockSource::new().with_delay(Duration::from_millis(20)));
    let fetcher = Fetcher::new(source.clone() as Arc<dyn KlineSource>, Timeframe::OneMinute);
    let cancel = ShutdownCoordinator::shared();

    let (a, b) = tokio::join!(
        fetcher.fill_gap("ETHBTC", minutes(0, 60), &cancel),
        fetcher.fill_gap("LTCBTC", minutes(0, 60), &cancel),
    );

    a.unwrap();
    b.unwrap();
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn completed_requests_are_not_reused() {
    let source = Arc::new(MockSource::new());
    let fetcher = Fetcher::new(source.clone() as Arc<dyn KlineSource>, Timeframe::OneMinute);
    let cancel = ShutdownCoordinator::shared();

    fetcher.fill_gap("ETHBTC", minutes(0, 60), &cancel).await.unwrap();
    fetcher.fill_gap("ETHBTC", minutes(0, 60), &cancel).await.unwrap();
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn concurrent_gets_share_one_fetch() {
    let temp = TempDir::new().unwrap();
    let (loader, source) = loader_with(temp.path(), MockSource::new().with_delay(Duration::from_millis(50)));

    let (a, b) = tokio::join!(
        loader.get("ETHBTC", minutes(0, 120)),
        loader.get("ETHBTC", minutes(0, 120)),
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(source.calls(), 1);

    let record = loader.cache().record("ETHBTC").await.unwrap();
    record.check_consistency().unwrap();
    assert_eq!(record.coverage().intervals(), &[minutes(0, 120)]);
}

#[tokio::test]
async fn wider_chunk_joins_a_narrower_one_already_in_flight() {
    let source = Arc::new(MockSource::new().with_delay(Duration::from_millis(20)));
    let fetcher = Fetcher::new(source.clone() as Arc<dyn KlineSource>, Timeframe::OneMinute);
    let cancel = ShutdownCoordinator::shared();

    let (narrow, wide) = tokio::join!(
        fetcher.fill_gap("ETHBTC", minutes(100, 200), &cancel),
        fetcher.fill_gap("ETHBTC", minutes(0, 1000), &cancel),
    );

    assert_eq!(narrow.unwrap().bars.len(), 100);
    let wide = wide.unwrap();
    assert_eq!(wide.interval, minutes(0, 1000));
    assert_eq!(wide.bars.len(), 1000);
    for (i, bar) in wide.bars.iter().enumerate() {
        assert_eq!(bar.open_time, i as i64 * MIN);
    }

    // Each minute went to the exchange once
    assert_eq!(
        source.requested_for("ETHBTC"),
        vec![minutes(0, 100), minutes(100, 200), minutes(200, 1000)]
    );
}

#[tokio::test]
async fn partly_overlapping_gets_fetch_shared_minutes_once() {
    let temp = TempDir::new().unwrap();
    let (loader, source) = loader_with(temp.path(), MockSource::new().with_delay(Duration::from_millis(50)));

    let (a, b) = tokio::join!(
        loader.get("ETHBTC", minutes(0, 500)),
        loader.get("ETHBTC", minutes(200, 700)),
    );

    assert_eq!(a.unwrap().len(), 500);
    let b = b.unwrap();
    assert_eq!(b.len(), 500);
    assert_eq!(b[0].open_time, 200 * MIN);

    assert_eq!(source.calls(), 2);
    let requested = source.requested_for("ETHBTC");
    let fetched: i64 = requested.iter().map(|r| (r.end - r.start) / MIN).sum();
    assert_eq!(fetched, 700, "overlapping minutes fetched twice: {requested:?}");

    let record = loader.cache().record("ETHBTC").await.unwrap();
    record.check_consistency().unwrap();
    assert_eq!(record.coverage().intervals(), &[minutes(0, 700)]);
}
