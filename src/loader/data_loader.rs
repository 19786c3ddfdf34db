//! Data loader facade
//!
//! `get` plans against the cache, fills every gap on a spawned task through
//! the shared [`Fetcher`], commits each completed run as soon as it arrives,
//! then reads exactly the requested range back. Failures stay inside their
//! gap and symbol; whatever was committed stays committed.

use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::job::{LoadJob, LoadPhase, LoadSummary};
use super::rate_limit::RateLimiter;
use super::{LoadError, LoadResult, LoaderConfig};
use crate::cache::{CacheError, CacheManager};
use crate::coverage::Interval;
use crate::fetcher::binance_http::build_http_client;
use crate::fetcher::{BinanceHttpClient, FetchError, Fetcher, KlineSource};
use crate::metrics::{record_cache_lookup, LoadMetrics};
use crate::shutdown::{CancelOnDrop, SharedShutdown, ShutdownCoordinator};
use crate::{normalize_symbol, Bar};

/// Consumer-facing loader of gap-free bar series
///
/// Clones share the cache handle, worker pool, rate limiter and in-flight
/// request table.
#[derive(Clone)]
pub struct DataLoader {
    config: LoaderConfig,
    cache: CacheManager,
    fetcher: Fetcher,
    shutdown: SharedShutdown,
}

impl DataLoader {
    /// Loader over an arbitrary kline source
    pub fn new(config: LoaderConfig, source: Arc<dyn KlineSource>) -> Self {
        let limiter = Arc::new(RateLimiter::weight_per_minute(config.weight_per_minute));
        let fetcher = Fetcher::new(source, config.timeframe)
            .with_rate_limiter(limiter)
            .with_max_concurrent_requests(config.max_concurrent_requests)
            .with_retry_policy(config.retry.clone())
            .with_request_timeout(config.request_timeout);
        let cache = CacheManager::new(&config.cache_dir, config.timeframe);

        Self {
            config,
            cache,
            fetcher,
            shutdown: ShutdownCoordinator::shared(),
        }
    }

    /// Loader over the Binance spot REST API described by `config`
    pub fn binance(config: LoaderConfig) -> LoadResult<Self> {
        let client = build_http_client(config.request_timeout)?;
        let mut source = BinanceHttpClient::new(client, config.base_url.clone());
        if let Some(api_key) = &config.api_key {
            source = source.with_api_key(api_key.clone());
        }
        Ok(Self::new(config, Arc::new(source)))
    }

    /// Cancel every call of this loader when `parent` is cancelled
    pub fn with_shutdown(mut self, parent: SharedShutdown) -> Self {
        self.shutdown = parent;
        self
    }

    /// Loader configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Cache handle
    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Rate limiter shared by every exchange call of this loader
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.fetcher.rate_limiter()
    }

    /// Bars covering exactly `requested`, ascending, fetching what is missing
    pub async fn get(&self, symbol: &str, requested: Interval) -> LoadResult<Vec<Bar>> {
        let symbol = self.check_request(symbol, &requested)?;
        let span = info_span!("get", symbol = %symbol, requested = %requested);

        async {
            let metrics = LoadMetrics::start(&symbol);
            let result = self.load(&symbol, requested, true).await;
            match &result {
                Ok((_, bars)) => metrics.record_success(bars.len()),
                Err(LoadError::Cancelled { .. }) => metrics.record_cancelled(),
                Err(e) => metrics.record_failure(&e.to_string()),
            }
            result.map(|(_, bars)| bars)
        }
        .instrument(span)
        .await
    }

    /// [`get`](Self::get) over `[start, end)` in Unix milliseconds
    pub async fn get_range(&self, symbol: &str, start: i64, end: i64) -> LoadResult<Vec<Bar>> {
        let requested = Interval::new(start, end).map_err(|e| LoadError::InvalidRequest(e.to_string()))?;
        self.get(symbol, requested).await
    }

    /// Make sure `requested` is cached without reading it back
    pub async fn ensure(&self, symbol: &str, requested: Interval) -> LoadResult<LoadSummary> {
        let symbol = self.check_request(symbol, &requested)?;
        let span = info_span!("ensure", symbol = %symbol, requested = %requested);

        async {
            let metrics = LoadMetrics::start(&symbol);
            let result = self.load(&symbol, requested, false).await;
            match &result {
                Ok((summary, _)) => metrics.record_success(summary.committed_bars),
                Err(LoadError::Cancelled { .. }) => metrics.record_cancelled(),
                Err(e) => metrics.record_failure(&e.to_string()),
            }
            result.map(|(summary, _)| summary)
        }
        .instrument(span)
        .await
    }

    /// Load every symbol over the same range, at most `symbol_concurrency` at once
    ///
    /// Results come back in input order; one symbol failing never affects the
    /// others.
    pub async fn get_many<S: AsRef<str>>(
        &self,
        symbols: &[S],
        requested: Interval,
    ) -> Vec<(String, LoadResult<Vec<Bar>>)> {
        stream::iter(symbols.iter().map(|s| s.as_ref().to_string()))
            .map(|symbol| async move {
                let result = self.get(&symbol, requested).await;
                (symbol, result)
            })
            .buffered(self.config.symbol_concurrency.max(1))
            .collect()
            .await
    }

    fn check_request(&self, symbol: &str, requested: &Interval) -> LoadResult<String> {
        let normalized = normalize_symbol(symbol)
            .ok_or_else(|| LoadError::InvalidRequest(format!("invalid symbol '{symbol}'")))?;

        let timeframe = self.config.timeframe;
        if requested.is_empty() {
            return Err(LoadError::InvalidRequest(format!("empty range {requested}")));
        }
        if !requested.is_aligned(timeframe) {
            return Err(LoadError::InvalidRequest(format!(
                "range {requested} is not aligned to {timeframe}"
            )));
        }
        Ok(normalized)
    }

    async fn load(&self, symbol: &str, requested: Interval, assemble: bool) -> LoadResult<(LoadSummary, Vec<Bar>)> {
        let cancel = self.shutdown.child();
        let guard = CancelOnDrop::new(cancel.clone());

        let mut job = LoadJob::new(symbol, requested);
        self.fill(&mut job, &cancel).await?;
        guard.disarm();

        let bars = if assemble {
            self.cache.read(symbol, requested).await?
        } else {
            Vec::new()
        };
        job.advance(LoadPhase::Done)?;

        debug!(
            symbol = %symbol,
            gaps = job.gaps.len(),
            committed = job.committed_bars,
            elapsed_ms = job.elapsed_ms(),
            "Load finished"
        );
        Ok((LoadSummary::from(&job), bars))
    }

    /// Planning and Filling; leaves the job in Assembling on success
    async fn fill(&self, job: &mut LoadJob, cancel: &SharedShutdown) -> LoadResult<()> {
        let gaps = self.cache.gaps(&job.symbol, &job.requested).await?;
        record_cache_lookup(&job.symbol, gaps.len());
        job.gaps = gaps;

        if job.gaps.is_empty() {
            debug!(symbol = %job.symbol, "Range fully cached");
            return job.advance(LoadPhase::Assembling);
        }

        job.advance(LoadPhase::Filling)?;
        info!(symbol = %job.symbol, gaps = job.gaps.len(), "Filling gaps");

        // Spawned so that dropping the caller lets in-flight work finish and commit
        let handles: Vec<_> = job
            .gaps
            .iter()
            .map(|gap| {
                let fetcher = self.fetcher.clone();
                let cache = self.cache.clone();
                let symbol = job.symbol.clone();
                let cancel = cancel.clone();
                let gap = *gap;
                tokio::spawn(
                    async move { fill_and_commit(&fetcher, &cache, &symbol, gap, &cancel).await }
                        .in_current_span(),
                )
            })
            .collect();

        let mut cause: Option<FetchError> = None;
        let mut cache_error: Option<CacheError> = None;
        let mut task_error: Option<String> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(outcome) => {
                    job.committed_bars += outcome.committed;
                    if cause.is_none() {
                        cause = outcome.cause;
                    }
                    if cache_error.is_none() {
                        cache_error = outcome.cache_error;
                    }
                }
                Err(e) => {
                    task_error.get_or_insert(e.to_string());
                }
            }
        }

        let missing = self.cache.gaps(&job.symbol, &job.requested).await?;
        if missing.is_empty() {
            return job.advance(LoadPhase::Assembling);
        }
        job.advance(LoadPhase::Failed)?;

        if cancel.is_shutdown_requested() {
            return Err(LoadError::Cancelled {
                symbol: job.symbol.clone(),
                missing,
            });
        }
        if let Some(e) = cache_error {
            return Err(LoadError::Cache(e));
        }
        if let Some(e) = task_error {
            return Err(LoadError::Task(e));
        }

        let missing_sub_interval = Interval {
            start: missing[0].start,
            end: missing[missing.len() - 1].end,
        };
        warn!(
            symbol = %job.symbol,
            missing = %missing_sub_interval,
            committed = job.committed_bars,
            "Range left partially filled"
        );
        Err(LoadError::PartialCoverage {
            symbol: job.symbol.clone(),
            missing_sub_interval,
            missing,
            cause,
        })
    }
}

/// Result of filling one gap
struct GapOutcome {
    committed: usize,
    cause: Option<FetchError>,
    cache_error: Option<CacheError>,
}

async fn fill_and_commit(
    fetcher: &Fetcher,
    cache: &CacheManager,
    symbol: &str,
    gap: Interval,
    cancel: &SharedShutdown,
) -> GapOutcome {
    let (runs, cause) = match fetcher.fill_gap(symbol, gap, cancel).await {
        Ok(run) => (vec![run], None),
        Err(partial) => {
            if !matches!(partial.cause, FetchError::Cancelled) {
                warn!(
                    symbol = %symbol,
                    gap = %gap,
                    failed = %partial.failed_sub_interval,
                    error = %partial.cause,
                    runs = partial.fetched.len(),
                    "Gap only partially fetched"
                );
            }
            (partial.fetched, Some(partial.cause))
        }
    };

    let mut outcome = GapOutcome {
        committed: 0,
        cause,
        cache_error: None,
    };
    for run in runs.into_iter().filter(|run| !run.bars.is_empty()) {
        match cache.commit(symbol, run.interval, run.bars).await {
            Ok(committed) => outcome.committed += committed,
            Err(e) => {
                warn!(symbol = %symbol, run = %run.interval, error = %e, "Commit failed");
                if outcome.cache_error.is_none() {
                    outcome.cache_error = Some(e);
                }
            }
        }
    }
    outcome
}
