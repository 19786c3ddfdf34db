//! Durable local cache of bars
//!
//! Layout per (symbol, timeframe) partition:
//!
//! ```text
//! <cache_dir>/<SYMBOL>/<timeframe>/
//!     coverage.json          schema-versioned CoverageRecord
//!     .lock                  advisory lock file
//!     blocks/<start>_<end>.csv
//! ```
//!
//! Only the [`CacheManager`] mutates a partition. Commits write their blocks
//! first and publish them with one atomic record replacement, so a crash
//! leaves at worst an unreferenced block file behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::coverage::{CoverageSet, Interval};
use crate::metrics::record_committed_bars;
use crate::{normalize_symbol, Bar, Timeframe};

pub mod block;
pub mod lock;
pub mod record;

use block::{read_block, verify_block, write_block, BLOCKS_DIR_NAME};
use lock::{with_exclusive, with_shared, PartitionLocks};
use record::{CoverageRecord, RECORD_FILE_NAME};

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Read outside the covered range
    #[error("{symbol}: range {requested} is not fully cached (missing {})", format_intervals(.missing))]
    UncoveredRange {
        /// Symbol read
        symbol: String,
        /// Requested range
        requested: Interval,
        /// Uncovered parts of the request
        missing: Vec<Interval>,
    },

    /// Bars handed to commit do not exactly cover the interval
    #[error("{symbol}: invalid commit: {message}")]
    InvalidCommit {
        /// Symbol committed
        symbol: String,
        /// What was wrong
        message: String,
    },

    /// Range bounds not aligned to the partition's timeframe
    #[error("invalid range {interval}: bounds must be aligned to {timeframe}")]
    MisalignedRange {
        /// Offending range
        interval: Interval,
        /// Partition timeframe
        timeframe: Timeframe,
    },

    /// Symbol is not a normalized exchange symbol
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),

    /// Stored data contradicts the coverage record
    #[error("{symbol}: cache integrity error: {message}")]
    Integrity {
        /// Symbol of the partition
        symbol: String,
        /// What was inconsistent
        message: String,
    },

    /// Block contents do not match the recorded checksum
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Block file path
        file: String,
        /// Recorded checksum
        expected: String,
        /// Checksum of the file on disk
        actual: String,
    },

    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// Record file exceeds maximum size
    #[error("coverage record too large: {size} bytes (max {max})")]
    RecordTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Lock error
    #[error("lock error: {0}")]
    Lock(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Render intervals as `[a, b), [c, d)`
pub fn format_intervals(intervals: &[Interval]) -> String {
    intervals
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cache partition key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    /// Normalized exchange symbol
    pub symbol: String,
    /// Bar granularity
    pub timeframe: Timeframe,
}

impl PartitionKey {
    /// Directory of the partition under `root`
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(&self.symbol).join(self.timeframe.as_str())
    }
}

/// Outcome of checking one partition on disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    /// Symbol checked
    pub symbol: String,
    /// Blocks whose checksum was verified
    pub blocks_checked: usize,
    /// Problems found (checksum mismatches, missing files, inconsistencies)
    pub failures: Vec<String>,
    /// Block files present on disk but referenced by no record
    pub orphans: Vec<String>,
}

impl VerifyReport {
    /// True when no failure was found
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Manager of the on-disk cache for one timeframe
#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
    timeframe: Timeframe,
    locks: Arc<PartitionLocks>,
}

impl CacheManager {
    /// Cache rooted at `root` holding `timeframe` bars
    pub fn new(root: impl AsRef<Path>, timeframe: Timeframe) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            timeframe,
            locks: Arc::new(PartitionLocks::new()),
        }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bar granularity of every partition handled here
    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    fn partition_dir(&self, symbol: &str) -> CacheResult<PathBuf> {
        match normalize_symbol(symbol) {
            Some(normalized) if normalized == symbol => Ok(PartitionKey {
                symbol: normalized,
                timeframe: self.timeframe,
            }
            .dir(&self.root)),
            _ => Err(CacheError::InvalidSymbol(symbol.to_string())),
        }
    }

    fn check_aligned(&self, interval: &Interval) -> CacheResult<()> {
        if interval.is_empty() || !interval.is_aligned(self.timeframe) {
            return Err(CacheError::MisalignedRange {
                interval: *interval,
                timeframe: self.timeframe,
            });
        }
        Ok(())
    }

    /// Full coverage record of a partition (empty if nothing is cached)
    pub async fn record(&self, symbol: &str) -> CacheResult<CoverageRecord> {
        let dir = self.partition_dir(symbol)?;
        let symbol = symbol.to_string();
        let timeframe = self.timeframe;
        blocking(move || {
            Ok(load_record(&dir)?.unwrap_or_else(|| CoverageRecord::new(symbol, timeframe)))
        })
        .await
    }

    /// Covered intervals of a partition; empty if none
    pub async fn coverage(&self, symbol: &str) -> CacheResult<CoverageSet> {
        Ok(self.record(symbol).await?.coverage().clone())
    }

    /// `requested` minus coverage: ascending, minimal, non-overlapping
    pub async fn gaps(&self, symbol: &str, requested: &Interval) -> CacheResult<Vec<Interval>> {
        Ok(self.coverage(symbol).await?.gaps(requested))
    }

    /// Durably add `bars`, which must exactly cover `interval`
    ///
    /// Already covered parts of `interval` are skipped, so committing the same
    /// data twice is a no-op. Returns the number of newly stored bars.
    pub async fn commit(&self, symbol: &str, interval: Interval, bars: Vec<Bar>) -> CacheResult<usize> {
        let dir = self.partition_dir(symbol)?;
        self.check_aligned(&interval)?;
        validate_series(symbol, &interval, &bars, self.timeframe)?;

        let _in_process = self.locks.lock(&dir).await;

        let symbol_owned = symbol.to_string();
        let timeframe = self.timeframe;
        let committed = blocking(move || {
            with_exclusive(&dir, || commit_locked(&dir, &symbol_owned, timeframe, interval, &bars))
        })
        .await?;

        if committed > 0 {
            record_committed_bars(symbol, committed);
            info!(symbol = %symbol, interval = %interval, bars = committed, "Committed bars to cache");
        } else {
            debug!(symbol = %symbol, interval = %interval, "Commit already covered");
        }
        Ok(committed)
    }

    /// Bars of `interval`, which must lie inside coverage
    pub async fn read(&self, symbol: &str, interval: Interval) -> CacheResult<Vec<Bar>> {
        let dir = self.partition_dir(symbol)?;
        self.check_aligned(&interval)?;

        let symbol = symbol.to_string();
        let timeframe = self.timeframe;
        blocking(move || read_locked(&dir, &symbol, timeframe, interval)).await
    }

    /// Verify the record and every block checksum of a partition
    pub async fn verify(&self, symbol: &str) -> CacheResult<VerifyReport> {
        let dir = self.partition_dir(symbol)?;
        let symbol = symbol.to_string();
        blocking(move || verify_partition(&dir, &symbol)).await
    }

    /// Symbols that have a record for this timeframe, sorted
    pub async fn symbols(&self) -> CacheResult<Vec<String>> {
        let root = self.root.clone();
        let timeframe = self.timeframe;
        blocking(move || {
            let entries = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(CacheError::Io(e.to_string())),
            };

            let mut symbols = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| CacheError::Io(e.to_string()))?;
                let name = entry.file_name().to_string_lossy().to_string();
                let has_record = entry
                    .path()
                    .join(timeframe.as_str())
                    .join(RECORD_FILE_NAME)
                    .is_file();
                if has_record {
                    symbols.push(name);
                }
            }
            symbols.sort();
            Ok(symbols)
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> CacheResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CacheResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Io(format!("blocking cache task failed: {e}")))?
}

fn load_record(dir: &Path) -> CacheResult<Option<CoverageRecord>> {
    if !dir.exists() {
        return Ok(None);
    }
    with_shared(dir, || CoverageRecord::load(&dir.join(RECORD_FILE_NAME)))
}

/// Bars must start at `interval.start`, step exactly one timeframe, and end at `interval.end`
fn validate_series(symbol: &str, interval: &Interval, bars: &[Bar], timeframe: Timeframe) -> CacheResult<()> {
    let invalid = |message: String| CacheError::InvalidCommit {
        symbol: symbol.to_string(),
        message,
    };

    let expected = interval.bar_count(timeframe);
    if bars.len() != expected {
        return Err(invalid(format!(
            "{} bars for {interval}, expected {expected}",
            bars.len()
        )));
    }

    let step = timeframe.to_milliseconds();
    for (i, bar) in bars.iter().enumerate() {
        let expected_time = interval.start + i as i64 * step;
        if bar.open_time != expected_time {
            return Err(invalid(format!(
                "bar {i} opens at {}, expected {expected_time}",
                bar.open_time
            )));
        }
        bar.validate()
            .map_err(|msg| invalid(format!("bar at {}: {msg}", bar.open_time)))?;
    }
    Ok(())
}

fn commit_locked(
    dir: &Path,
    symbol: &str,
    timeframe: Timeframe,
    interval: Interval,
    bars: &[Bar],
) -> CacheResult<usize> {
    let path = dir.join(RECORD_FILE_NAME);
    let mut record = CoverageRecord::load(&path)?.unwrap_or_else(|| CoverageRecord::new(symbol, timeframe));

    let new_parts = record.coverage().gaps(&interval);
    if new_parts.is_empty() {
        return Ok(0);
    }

    let step = timeframe.to_milliseconds();
    let mut committed = 0;
    for part in new_parts {
        let from = ((part.start - interval.start) / step) as usize;
        let to = ((part.end - interval.start) / step) as usize;
        let block = write_block(dir, part, &bars[from..to])?;
        committed += block.bars;
        record.add_block(block);
    }

    record.save(&path)?;
    Ok(committed)
}

fn read_locked(dir: &Path, symbol: &str, timeframe: Timeframe, interval: Interval) -> CacheResult<Vec<Bar>> {
    let uncovered = |missing: Vec<Interval>| CacheError::UncoveredRange {
        symbol: symbol.to_string(),
        requested: interval,
        missing,
    };

    if !dir.exists() {
        return Err(uncovered(vec![interval]));
    }

    with_shared(dir, || {
        let record = CoverageRecord::load(&dir.join(RECORD_FILE_NAME))?
            .ok_or_else(|| uncovered(vec![interval]))?;

        if !record.coverage().covers(&interval) {
            return Err(uncovered(record.coverage().gaps(&interval)));
        }

        let mut bars = Vec::with_capacity(interval.bar_count(timeframe));
        for block in record.blocks_overlapping(&interval) {
            let block_bars = read_block(dir, block)?;
            if block_bars.len() != block.bars {
                return Err(CacheError::Integrity {
                    symbol: symbol.to_string(),
                    message: format!(
                        "block {} holds {} bars, record says {}",
                        block.file,
                        block_bars.len(),
                        block.bars
                    ),
                });
            }
            bars.extend(
                block_bars
                    .into_iter()
                    .filter(|bar| interval.contains_ts(bar.open_time)),
            );
        }

        validate_series(symbol, &interval, &bars, timeframe).map_err(|e| CacheError::Integrity {
            symbol: symbol.to_string(),
            message: e.to_string(),
        })?;
        Ok(bars)
    })
}

fn verify_partition(dir: &Path, symbol: &str) -> CacheResult<VerifyReport> {
    let mut report = VerifyReport {
        symbol: symbol.to_string(),
        ..VerifyReport::default()
    };

    let Some(record) = load_record(dir)? else {
        return Ok(report);
    };

    with_shared(dir, || {
        if let Err(e) = record.check_consistency() {
            report.failures.push(e.to_string());
        }

        for block in record.blocks() {
            report.blocks_checked += 1;
            if let Err(e) = verify_block(dir, block) {
                warn!(symbol = %symbol, file = %block.file, error = %e, "Block verification failed");
                report.failures.push(e.to_string());
            }
        }

        let referenced: HashSet<&str> = record.blocks().iter().map(|b| b.file.as_str()).collect();
        if let Ok(entries) = std::fs::read_dir(dir.join(BLOCKS_DIR_NAME)) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".csv") && !referenced.contains(name.as_str()) {
                    report.orphans.push(name);
                }
            }
        }
        report.orphans.sort();
        Ok(())
    })?;

    Ok(report)
}
