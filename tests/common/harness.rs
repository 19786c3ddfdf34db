//! Loader construction shared by the integration tests

use kline_cache::loader::{DataLoader, LoaderConfig, RetryPolicy};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::mock_source::MockSource;

/// Config with millisecond backoff so retry tests stay fast
pub fn fast_config(cache_dir: &Path) -> LoaderConfig {
    LoaderConfig::new(cache_dir).with_retry_policy(
        RetryPolicy::with_max_attempts(5)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(0.0),
    )
}

/// Loader over `source` with [`fast_config`]
pub fn loader_with(cache_dir: &Path, source: MockSource) -> (DataLoader, Arc<MockSource>) {
    let source = Arc::new(source);
    let loader = DataLoader::new(fast_config(cache_dir), source.clone());
    (loader, source)
}
