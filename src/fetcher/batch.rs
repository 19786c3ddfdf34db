//! Batch fetcher
//!
//! Turns gaps into validated bar runs. Every chunk of every gap goes through
//! the same sequence: pool slot, limiter tokens, one client call under a
//! timeout, parse. Transient failures are retried per the [`RetryPolicy`].
//! Requests run on their own tasks and are registered per (symbol, grid cell)
//! while in flight; any overlapping chunk joins them for the shared minutes
//! instead of requesting those minutes again.

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn, Instrument};

use crate::coverage::Interval;
use crate::fetcher::binance_config::SPOT_CONFIG;
use crate::fetcher::binance_parser::BinanceParser;
use crate::fetcher::chunking::{grid_cell, split_into_chunks};
use crate::fetcher::retry_formatter::RetryContext;
use crate::fetcher::{
    FetchError, FetchResult, FetchedRun, GapResult, KlineRequest, KlineSource, PartialFetchError,
};
use crate::loader::config::{DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::loader::rate_limit::RateLimiter;
use crate::loader::retry::RetryPolicy;
use crate::metrics::record_retry_backoff;
use crate::shutdown::SharedShutdown;
use crate::{Bar, Timeframe};

type ChunkOutput = Result<Arc<Vec<Bar>>, FetchError>;
type SharedChunk = Shared<BoxFuture<'static, ChunkOutput>>;

/// One in-flight chunk request that others may join
struct InFlight {
    id: u64,
    interval: Interval,
    future: SharedChunk,
}

/// In-flight requests keyed by symbol and grid cell start
type InFlightMap = HashMap<(String, i64), Vec<InFlight>>;

/// Part of a chunk and the request that serves it
struct Piece {
    part: Interval,
    covering: Interval,
    future: SharedChunk,
}

/// Removes an in-flight entry when its request task ends, panics included
struct Registration {
    in_flight: Arc<Mutex<InFlightMap>>,
    key: (String, i64),
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entries) = in_flight.get_mut(&self.key) {
            entries.retain(|e| e.id != self.id);
            if entries.is_empty() {
                in_flight.remove(&self.key);
            }
        }
    }
}

/// Fetches gaps through a shared worker pool and rate limiter
///
/// Cloning is cheap; clones share the pool, the limiter and the in-flight
/// table, so one `Fetcher` serves a whole batch of symbols.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn KlineSource>,
    limiter: Arc<RateLimiter>,
    pool: Arc<Semaphore>,
    retry: RetryPolicy,
    request_timeout: Duration,
    timeframe: Timeframe,
    in_flight: Arc<Mutex<InFlightMap>>,
    next_id: Arc<AtomicU64>,
}

impl Fetcher {
    /// Fetcher over `source` with default pool size, limiter and retry policy
    pub fn new(source: Arc<dyn KlineSource>, timeframe: Timeframe) -> Self {
        Self {
            source,
            limiter: Arc::new(RateLimiter::weight_per_minute(SPOT_CONFIG.weight_per_minute)),
            pool: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_REQUESTS)),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            timeframe,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share `limiter` with every request
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Set the number of concurrent requests
    pub fn with_max_concurrent_requests(mut self, n: usize) -> Self {
        self.pool = Arc::new(Semaphore::new(n.max(1)));
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-attempt timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Bar granularity
    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// The shared rate limiter
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetch every gap; one result per gap, in the order given
    pub async fn fill(&self, symbol: &str, gaps: &[Interval], cancel: &SharedShutdown) -> Vec<GapResult> {
        join_all(gaps.iter().map(|gap| self.fill_gap(symbol, *gap, cancel))).await
    }

    /// Fetch one gap
    ///
    /// On failure the error names the failed span and carries every
    /// successfully fetched contiguous run of the gap.
    pub async fn fill_gap(&self, symbol: &str, gap: Interval, cancel: &SharedShutdown) -> GapResult {
        let chunks = split_into_chunks(&gap, self.timeframe, self.source.max_limit());
        debug!(symbol = %symbol, gap = %gap, chunks = chunks.len(), "Filling gap");

        let results = join_all(
            chunks
                .iter()
                .map(|chunk| self.fetch_chunk(symbol, *chunk, cancel)),
        )
        .await;

        assemble_gap(symbol, gap, &chunks, results)
    }

    /// Fetch one grid-aligned chunk
    ///
    /// Parts of the chunk already being fetched join those requests; only the
    /// remainder goes to the network.
    async fn fetch_chunk(&self, symbol: &str, chunk: Interval, cancel: &SharedShutdown) -> FetchResult<Vec<Bar>> {
        'restart: loop {
            let pieces = self.join_or_start(symbol, chunk, cancel);
            let results = join_all(pieces.iter().map(|piece| piece.future.clone())).await;

            let mut bars = Vec::with_capacity(chunk.bar_count(self.timeframe));
            for (piece, result) in pieces.iter().zip(results) {
                match result {
                    Ok(fetched) => bars.extend(slice_bars(&fetched, &piece.covering, &piece.part, self.timeframe)),
                    // Joined a request whose owner was cancelled; we were not
                    Err(FetchError::Cancelled) if !cancel.is_shutdown_requested() => {
                        debug!(symbol = %symbol, chunk = %chunk, "Joined request was cancelled, restarting");
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(bars);
        }
    }

    /// Split `chunk` into parts served by in-flight requests and parts that
    /// need a new one, registering the new ones
    fn join_or_start(&self, symbol: &str, chunk: Interval, cancel: &SharedShutdown) -> Vec<Piece> {
        let cell = grid_cell(chunk.start, self.timeframe, self.source.max_limit());
        let key = (symbol.to_string(), cell.start);

        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entries = in_flight.entry(key.clone()).or_default();

        let mut overlapping: Vec<&InFlight> = entries.iter().filter(|e| e.interval.overlaps(&chunk)).collect();
        overlapping.sort_by_key(|e| e.interval.start);

        let mut plan: Vec<(Interval, Option<(Interval, SharedChunk)>)> = Vec::new();
        let mut cursor = chunk.start;
        for existing in overlapping {
            if existing.interval.end <= cursor {
                continue;
            }
            if existing.interval.start > cursor {
                plan.push((
                    Interval {
                        start: cursor,
                        end: existing.interval.start,
                    },
                    None,
                ));
            }
            let part = Interval {
                start: cursor.max(existing.interval.start),
                end: existing.interval.end.min(chunk.end),
            };
            debug!(symbol = %symbol, part = %part, joined = %existing.interval, "Joining in-flight request");
            plan.push((part, Some((existing.interval, existing.future.clone()))));
            cursor = part.end;
        }
        if cursor < chunk.end {
            plan.push((
                Interval {
                    start: cursor,
                    end: chunk.end,
                },
                None,
            ));
        }

        let mut pieces = Vec::with_capacity(plan.len());
        let mut tasks = Vec::new();
        for (part, joined) in plan {
            let piece = match joined {
                Some((covering, future)) => Piece { part, covering, future },
                None => {
                    let (future, task) = self.register_request(entries, &key, symbol, part, cancel);
                    tasks.push(task);
                    Piece {
                        part,
                        covering: part,
                        future,
                    }
                }
            };
            pieces.push(piece);
        }
        drop(in_flight);

        // Spawned outside the lock: a task dropped at spawn unregisters itself
        for task in tasks {
            tokio::spawn(task.in_current_span());
        }
        pieces
    }

    /// Register a request for `part` in `entries` and build the task that runs it
    ///
    /// The task owns its pool permit and unregisters itself when it ends, so
    /// it completes even if every requester is dropped.
    fn register_request(
        &self,
        entries: &mut Vec<InFlight>,
        key: &(String, i64),
        symbol: &str,
        part: Interval,
        cancel: &SharedShutdown,
    ) -> (SharedChunk, BoxFuture<'static, ()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let symbol = symbol.to_string();
        let cancel = cancel.clone();
        let registration = Registration {
            in_flight: self.in_flight.clone(),
            key: key.clone(),
            id,
        };
        let (tx, rx) = oneshot::channel::<ChunkOutput>();

        let task = async move {
            let result = this.fetch_with_retry(&symbol, part, &cancel).await.map(Arc::new);
            drop(registration);
            let _ = tx.send(result);
        }
        .boxed();

        // A task that never reports was dropped with the runtime
        let future = rx
            .map(|received| received.unwrap_or(Err(FetchError::Cancelled)))
            .boxed()
            .shared();

        entries.push(InFlight {
            id,
            interval: part,
            future: future.clone(),
        });
        (future, task)
    }

    /// Retry loop for one chunk
    async fn fetch_with_retry(&self, symbol: &str, chunk: Interval, cancel: &SharedShutdown) -> FetchResult<Vec<Bar>> {
        let request = KlineRequest {
            symbol: symbol.to_string(),
            timeframe: self.timeframe,
            interval: chunk,
            limit: self.source.max_limit(),
        };

        let mut attempt = 0u32;
        let mut last_error: Option<FetchError> = None;
        loop {
            attempt += 1;
            if cancel.is_shutdown_requested() {
                return Err(FetchError::Cancelled);
            }

            match self.attempt_once(&request, cancel).await {
                Ok(bars) => {
                    if let Some(previous) = &last_error {
                        let ctx = RetryContext::new(
                            attempt,
                            self.retry.max_attempts,
                            previous,
                            Duration::ZERO,
                            symbol,
                            chunk,
                        );
                        info!("{}", ctx.format_success());
                    }
                    return Ok(bars);
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(err) => {
                    if !self.retry.should_retry(&err, attempt) {
                        let ctx = RetryContext::new(
                            attempt,
                            self.retry.max_attempts,
                            &err,
                            Duration::ZERO,
                            symbol,
                            chunk,
                        );
                        warn!("{}", ctx.format_failure());
                        return Err(err);
                    }

                    let delay = self.retry.delay_for(attempt, err.retry_after());
                    if let Some(retry_after) = err.retry_after() {
                        self.limiter.pause_for(retry_after).await;
                    }

                    let ctx = RetryContext::new(
                        attempt,
                        self.retry.max_attempts,
                        &err,
                        delay,
                        symbol,
                        chunk,
                    );
                    warn!("{}", ctx.format_retry());
                    record_retry_backoff(delay, attempt);
                    last_error = Some(err);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {},
                        _ = cancel.wait_for_shutdown() => return Err(FetchError::Cancelled),
                    }
                }
            }
        }
    }

    /// Pool slot, limiter tokens, one timed call, parse
    ///
    /// Cancellation is honoured while waiting for a slot or tokens; once the
    /// request is sent it runs to completion.
    async fn attempt_once(&self, request: &KlineRequest, cancel: &SharedShutdown) -> FetchResult<Vec<Bar>> {
        let _permit = tokio::select! {
            permit = self.pool.acquire() => permit.map_err(|_| FetchError::Cancelled)?,
            _ = cancel.wait_for_shutdown() => return Err(FetchError::Cancelled),
        };

        tokio::select! {
            acquired = self.limiter.acquire(self.source.request_weight()) => {
                acquired.map_err(|e| FetchError::InvalidRequest(e.to_string()))?
            }
            _ = cancel.wait_for_shutdown() => return Err(FetchError::Cancelled),
        }

        let raw = tokio::time::timeout(self.request_timeout, self.source.fetch_klines(request))
            .await
            .map_err(|_| FetchError::Timeout(self.request_timeout))??;

        let bars = BinanceParser::parse_klines(&raw, &request.symbol, request.timeframe)?;
        check_exact_cover(&bars, &request.interval, request.timeframe, &request.symbol)?;

        debug!(
            symbol = %request.symbol,
            chunk = %request.interval,
            bars = bars.len(),
            "Chunk fetched"
        );
        Ok(bars)
    }
}

/// A contiguous parsed series must start at the chunk start and end at its end
fn check_exact_cover(bars: &[Bar], chunk: &Interval, timeframe: Timeframe, symbol: &str) -> FetchResult<()> {
    let step = timeframe.to_milliseconds();
    let Some(first) = bars.first() else {
        return Err(FetchError::integrity(
            chunk.start,
            format!("{symbol}: exchange returned no bars for {chunk}"),
        ));
    };

    if first.open_time != chunk.start {
        return Err(FetchError::integrity(
            chunk.start,
            format!("{symbol}: series starts at {} instead of chunk start", first.open_time),
        ));
    }

    let expected = chunk.bar_count(timeframe);
    if bars.len() != expected {
        let missing_at = first.open_time + bars.len() as i64 * step;
        return Err(FetchError::integrity(
            missing_at.min(chunk.end),
            format!("{symbol}: expected {expected} bars for {chunk}, got {}", bars.len()),
        ));
    }
    Ok(())
}

/// Bars of `chunk` taken from a result that covers `covering`
fn slice_bars(bars: &[Bar], covering: &Interval, chunk: &Interval, timeframe: Timeframe) -> Vec<Bar> {
    let step = timeframe.to_milliseconds();
    let from = ((chunk.start - covering.start) / step) as usize;
    let to = ((chunk.end - covering.start) / step) as usize;
    bars[from.min(bars.len())..to.min(bars.len())].to_vec()
}

/// Combine per-chunk results into a gap result
fn assemble_gap(
    symbol: &str,
    gap: Interval,
    chunks: &[Interval],
    results: Vec<FetchResult<Vec<Bar>>>,
) -> GapResult {
    let mut runs: Vec<FetchedRun> = Vec::new();
    let mut current: Option<FetchedRun> = None;
    let mut first_error: Option<FetchError> = None;
    let mut failed_span: Option<Interval> = None;

    for (chunk, result) in chunks.iter().zip(results) {
        match result {
            Ok(bars) => match current.as_mut() {
                Some(run) => {
                    run.interval.end = chunk.end;
                    run.bars.extend(bars);
                }
                None => {
                    current = Some(FetchedRun {
                        interval: *chunk,
                        bars,
                    });
                }
            },
            Err(err) => {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
                failed_span = Some(match failed_span {
                    Some(span) => Interval {
                        start: span.start,
                        end: chunk.end,
                    },
                    None => *chunk,
                });
                first_error.get_or_insert(err);
            }
        }
    }
    if let Some(run) = current.take() {
        runs.push(run);
    }

    match (first_error, failed_span) {
        (Some(cause), Some(failed_sub_interval)) => Err(PartialFetchError {
            symbol: symbol.to_string(),
            gap,
            failed_sub_interval,
            cause,
            fetched: runs,
        }),
        _ => match runs.pop() {
            Some(run) => Ok(run),
            None => Ok(FetchedRun {
                interval: gap,
                bars: Vec::new(),
            }),
        },
    }
}
