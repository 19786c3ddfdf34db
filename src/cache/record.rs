//! Coverage record persistence
//!
//! `coverage.json` is the single source of truth for a partition: the covered
//! intervals plus the immutable bar blocks that hold them. It is replaced
//! atomically (temp file, fsync, rename, directory fsync) and only ever
//! references blocks that are already durable.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

use super::CacheError;
use crate::coverage::{CoverageSet, Interval};
use crate::Timeframe;

/// Current coverage record schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum allowed record file size (10 MB) to prevent memory exhaustion
pub const MAX_RECORD_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// File name of the record inside a partition directory
pub const RECORD_FILE_NAME: &str = "coverage.json";

/// One immutable block of bars on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Exact span of the bars in the block
    pub interval: Interval,
    /// File name relative to the partition's `blocks/` directory
    pub file: String,
    /// Hex SHA-256 of the file contents
    pub sha256: String,
    /// Number of bars in the block
    pub bars: usize,
}

/// Persistent coverage bookkeeping for one (symbol, timeframe) partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRecord {
    schema_version: String,
    symbol: String,
    timeframe: Timeframe,
    coverage: CoverageSet,
    blocks: Vec<BlockRef>,
    updated_at: i64,
}

impl CoverageRecord {
    /// Empty record for a partition
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            symbol: symbol.into(),
            timeframe,
            coverage: CoverageSet::new(),
            blocks: Vec::new(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Symbol of the partition
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Timeframe of the partition
    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Covered intervals
    pub fn coverage(&self) -> &CoverageSet {
        &self.coverage
    }

    /// Blocks in ascending interval order
    pub fn blocks(&self) -> &[BlockRef] {
        &self.blocks
    }

    /// Last modification time (Unix ms)
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Blocks overlapping `interval`, ascending
    pub fn blocks_overlapping<'a>(&'a self, interval: &'a Interval) -> impl Iterator<Item = &'a BlockRef> + 'a {
        let first = self.blocks.partition_point(|b| b.interval.end <= interval.start);
        self.blocks[first..]
            .iter()
            .take_while(move |b| b.interval.start < interval.end)
    }

    /// Register a durable block and extend coverage with it
    ///
    /// The caller guarantees the block does not overlap existing coverage.
    pub fn add_block(&mut self, block: BlockRef) {
        self.coverage.insert(block.interval);
        let idx = self
            .blocks
            .partition_point(|b| b.interval.start < block.interval.start);
        self.blocks.insert(idx, block);
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// Check that blocks are disjoint and tile the coverage exactly
    pub fn check_consistency(&self) -> Result<(), CacheError> {
        for pair in self.blocks.windows(2) {
            if pair[0].interval.end > pair[1].interval.start {
                return Err(CacheError::Integrity {
                    symbol: self.symbol.clone(),
                    message: format!(
                        "blocks {} and {} overlap",
                        pair[0].interval, pair[1].interval
                    ),
                });
            }
        }

        let rebuilt = CoverageSet::from_intervals(self.blocks.iter().map(|b| b.interval));
        if rebuilt != self.coverage {
            return Err(CacheError::Integrity {
                symbol: self.symbol.clone(),
                message: "coverage does not match blocks".to_string(),
            });
        }
        Ok(())
    }

    /// Load the record at `path`; `None` if it does not exist yet
    pub fn load(path: &Path) -> Result<Option<Self>, CacheError> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e.to_string())),
        };
        if metadata.len() > MAX_RECORD_FILE_SIZE {
            return Err(CacheError::RecordTooLarge {
                size: metadata.len(),
                max: MAX_RECORD_FILE_SIZE,
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| CacheError::Io(e.to_string()))?;
        let record: CoverageRecord = serde_json::from_str(&contents).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to deserialize coverage record");
            CacheError::Serialization(e.to_string())
        })?;

        if record.schema_version != SCHEMA_VERSION {
            return Err(CacheError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: record.schema_version,
            });
        }
        Ok(Some(record))
    }

    /// Atomically replace the record at `path`
    ///
    /// Callers hold the partition's exclusive lock.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent_dir).map_err(|e| CacheError::Io(e.to_string()))?;

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| CacheError::Io(format!("Failed to create temp file: {e}")))?;
        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| CacheError::Io(format!("Failed to write temp file: {e}")))?;
        temp_file
            .flush()
            .map_err(|e| CacheError::Io(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| CacheError::Io(format!("Failed to sync temp file: {e}")))?;
        temp_file
            .persist(path)
            .map_err(|e| CacheError::Io(format!("Failed to persist temp file: {e}")))?;

        sync_dir(parent_dir);

        debug!(
            path = %path.display(),
            intervals = self.coverage.intervals().len(),
            blocks = self.blocks.len(),
            "Coverage record saved"
        );
        Ok(())
    }
}

/// Fsync a directory so a rename inside it is durable
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(dir) = std::fs::File::open(dir) {
        let _ = dir.sync_all();
    }
}
