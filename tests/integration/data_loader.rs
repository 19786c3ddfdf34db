//! End-to-end loads against a scripted source

use kline_cache::cache::CacheManager;
use kline_cache::{Bar, Timeframe};
use tempfile::TempDir;

use crate::common::harness::loader_with;
use crate::common::mock_source::{minutes, MockSource, MIN};

fn assert_contiguous(bars: &[Bar], start: i64, count: usize) {
    assert_eq!(bars.len(), count, "bar count");
    for (i, bar) in bars.iter().enumerate() {
        assert_eq!(bar.open_time, start + i as i64 * MIN, "bar {i} out of place");
    }
}

#[tokio::test]
async fn second_get_makes_no_requests() {
    let temp = TempDir::new().unwrap();
    let (loader, source) = loader_with(temp.path(), MockSource::new());
    let requested = minutes(0, 120);

    let first = loader.get("ETHBTC", requested).await.unwrap();
    let calls_after_first = source.calls();
    assert!(calls_after_first > 0);

    let second = loader.get("ETHBTC", requested).await.unwrap();
    assert_eq!(source.calls(), calls_after_first, "cached range hit the network");
    assert_eq!(first, second);
    assert_contiguous(&second, 0, 120);
}

#[tokio::test]
async fn large_range_is_split_into_grid_chunks() {
    let temp = TempDir::new().unwrap();
    let (loader, source) = loader_with(temp.path(), MockSource::new().with_max_limit(100));

    let bars = loader.get("ETHBTC", minutes(50, 330)).await.unwrap();
    assert_contiguous(&bars, 50 * MIN, 280);

    assert_eq!(
        source.requested_for("ETHBTC"),
        vec![
            minutes(50, 100),
            minutes(100, 200),
            minutes(200, 300),
            minutes(300, 330)
        ]
    );
}

#[tokio::test]
async fn overlapping_request_fetches_only_the_new_part() {
    let temp = TempDir::new().unwrap();
    let (loader, source) = loader_with(temp.path(), MockSource::new());

    loader.get("ETHBTC", minutes(0, 100)).await.unwrap();
    source.reset_log();

    let bars = loader.get("ETHBTC", minutes(50, 150)).await.unwrap();
    assert_contiguous(&bars, 50 * MIN, 100);
    assert_eq!(source.requested(), vec![minutes(100, 150)]);

    let coverage = loader.cache().coverage("ETHBTC").await.unwrap();
    assert_eq!(coverage.intervals(), &[minutes(0, 150)]);
}

#[tokio::test]
async fn gaps_around_cached_middle_are_filled_in_order() {
    let temp = TempDir::new().unwrap();
    let (loader, source) = loader_with(temp.path(), MockSource::new());

    loader.get("ETHBTC", minutes(40, 60)).await.unwrap();
    source.reset_log();

    let bars = loader.get("ETHBTC", minutes(0, 100)).await.unwrap();
    assert_contiguous(&bars, 0, 100);
    assert_eq!(
        source.requested_for("ETHBTC"),
        vec![minutes(0, 40), minutes(60, 100)]
    );

    let record = loader.cache().record("ETHBTC").await.unwrap();
    record.check_consistency().unwrap();
    assert_eq!(record.coverage().intervals(), &[minutes(0, 100)]);
}

#[tokio::test]
async fn get_many_returns_results_in_input_order() {
    let temp = TempDir::new().unwrap();
    let (loader, _) = loader_with(temp.path(), MockSource::new());
    let requested = minutes(0, 30);

    let results = loader
        .get_many(&["LTCBTC", "ethbtc", "BNB/BTC"], requested)
        .await;

    let names: Vec<&str> = results.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(names, vec!["LTCBTC", "ethbtc", "BNB/BTC"]);
    for (_, result) in &results {
        assert_contiguous(result.as_ref().unwrap(), 0, 30);
    }

    let cache = CacheManager::new(temp.path(), Timeframe::OneMinute);
    assert_eq!(cache.symbols().await.unwrap(), vec!["BNBBTC", "ETHBTC", "LTCBTC"]);
}

#[tokio::test]
async fn cache_survives_a_new_loader() {
    let temp = TempDir::new().unwrap();
    {
        let (loader, _) = loader_with(temp.path(), MockSource::new());
        loader.get("ETHBTC", minutes(0, 60)).await.unwrap();
    }

    let (loader, source) = loader_with(temp.path(), MockSource::new());
    let bars = loader.get("ETHBTC", minutes(10, 20)).await.unwrap();
    assert_contiguous(&bars, 10 * MIN, 10);
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn get_range_matches_get() {
    let temp = TempDir::new().unwrap();
    let (loader, _) = loader_with(temp.path(), MockSource::new());

    let by_range = loader.get_range("ETHBTC", 0, 15 * MIN).await.unwrap();
    let by_interval = loader.get("ETHBTC", minutes(0, 15)).await.unwrap();
    assert_eq!(by_range, by_interval);
}
