//! Bar block files
//!
//! A block is an immutable CSV file (`open_time,open,high,low,close,volume`)
//! under `<partition>/blocks/`, named `<start>_<end>.csv` after the interval it
//! holds. It is staged in a temp file, fsynced and renamed into place before
//! any record references it.

use csv::{ReaderBuilder, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use super::record::{sync_dir, BlockRef};
use super::CacheError;
use crate::coverage::Interval;
use crate::Bar;

/// Directory holding blocks inside a partition
pub const BLOCKS_DIR_NAME: &str = "blocks";

/// CSV row of a block; decimals kept as text so they round-trip exactly
#[derive(Debug, Serialize, Deserialize)]
struct BlockRow {
    open_time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

impl From<&Bar> for BlockRow {
    fn from(bar: &Bar) -> Self {
        Self {
            open_time: bar.open_time,
            open: bar.open.to_string(),
            high: bar.high.to_string(),
            low: bar.low.to_string(),
            close: bar.close.to_string(),
            volume: bar.volume.to_string(),
        }
    }
}

impl TryFrom<BlockRow> for Bar {
    type Error = CacheError;

    fn try_from(row: BlockRow) -> Result<Self, Self::Error> {
        let parse = |value: &str, name: &str| {
            Decimal::from_str(value).map_err(|e| {
                CacheError::Serialization(format!(
                    "Invalid {name} '{value}' at {}: {e}",
                    row.open_time
                ))
            })
        };
        Ok(Bar {
            open_time: row.open_time,
            open: parse(&row.open, "open")?,
            high: parse(&row.high, "high")?,
            low: parse(&row.low, "low")?,
            close: parse(&row.close, "close")?,
            volume: parse(&row.volume, "volume")?,
        })
    }
}

/// Compute SHA-256 checksum of bytes, hex encoded
pub fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// File name of the block holding `interval`
pub fn block_file_name(interval: &Interval) -> String {
    format!("{}_{}.csv", interval.start, interval.end)
}

fn encode(bars: &[Bar]) -> Result<Vec<u8>, CacheError> {
    let mut writer = Writer::from_writer(Vec::with_capacity(bars.len() * 64));
    for bar in bars {
        writer
            .serialize(BlockRow::from(bar))
            .map_err(|e| CacheError::Serialization(format!("Failed to encode bar: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| CacheError::Serialization(format!("Failed to finish block: {e}")))
}

/// Durably write `bars` (exactly covering `interval`) as a block
pub fn write_block(partition_dir: &Path, interval: Interval, bars: &[Bar]) -> Result<BlockRef, CacheError> {
    let blocks_dir = partition_dir.join(BLOCKS_DIR_NAME);
    std::fs::create_dir_all(&blocks_dir).map_err(|e| CacheError::Io(e.to_string()))?;

    let data = encode(bars)?;
    let sha256 = compute_sha256(&data);
    let file = block_file_name(&interval);

    let mut temp_file = tempfile::NamedTempFile::new_in(&blocks_dir)
        .map_err(|e| CacheError::Io(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(&data)
        .map_err(|e| CacheError::Io(format!("Failed to write block: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| CacheError::Io(format!("Failed to sync block: {e}")))?;
    temp_file
        .persist(blocks_dir.join(&file))
        .map_err(|e| CacheError::Io(format!("Failed to persist block: {e}")))?;
    sync_dir(&blocks_dir);

    debug!(file = %file, bars = bars.len(), "Block written");
    Ok(BlockRef {
        interval,
        file,
        sha256,
        bars: bars.len(),
    })
}

fn read_verified(partition_dir: &Path, block: &BlockRef) -> Result<Vec<u8>, CacheError> {
    let path = partition_dir.join(BLOCKS_DIR_NAME).join(&block.file);
    let data = std::fs::read(&path)
        .map_err(|e| CacheError::Io(format!("Failed to read {}: {e}", path.display())))?;

    let actual = compute_sha256(&data);
    if actual != block.sha256 {
        return Err(CacheError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: block.sha256.clone(),
            actual,
        });
    }
    Ok(data)
}

/// Read a block, verifying its checksum
pub fn read_block(partition_dir: &Path, block: &BlockRef) -> Result<Vec<Bar>, CacheError> {
    let data = read_verified(partition_dir, block)?;

    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(data.as_slice());
    let mut bars = Vec::with_capacity(block.bars);
    for row in reader.deserialize::<BlockRow>() {
        let row = row.map_err(|e| CacheError::Serialization(format!("Failed to decode bar: {e}")))?;
        bars.push(Bar::try_from(row)?);
    }
    Ok(bars)
}

/// Check a block on disk against its checksum without decoding it
pub fn verify_block(partition_dir: &Path, block: &BlockRef) -> Result<(), CacheError> {
    read_verified(partition_dir, block).map(|_| ())
}
