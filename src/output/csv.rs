//! Aggregated CSV export
//!
//! One file for the whole universe, one row per bar:
//! `symbol,open_time,open,high,low,close,volume`.

use csv::Writer;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info};

use super::{BarsWriter, OutputError, OutputResult, OutputWriter};
use crate::Bar;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// CSV record for one bar of one symbol
#[derive(Debug, Serialize)]
struct ExportRecord<'a> {
    symbol: &'a str,
    open_time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

impl<'a> ExportRecord<'a> {
    fn new(symbol: &'a str, bar: &Bar) -> Self {
        Self {
            symbol,
            open_time: bar.open_time,
            open: bar.open.to_string(),
            high: bar.high.to_string(),
            low: bar.low.to_string(),
            close: bar.close.to_string(),
            volume: bar.volume.to_string(),
        }
    }
}

/// CSV writer for the aggregated export
pub struct CsvExportWriter {
    writer: Writer<BufWriter<File>>,
    bars_written: u64,
}

impl CsvExportWriter {
    /// Create (or truncate) the export file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> OutputResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Creating CSV export");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OutputError::IoError(format!("Failed to create directory: {e}")))?;
        }

        let file = File::create(path)
            .map_err(|e| OutputError::IoError(format!("Failed to create file: {e}")))?;

        Ok(Self {
            writer: Writer::from_writer(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, file)),
            bars_written: 0,
        })
    }

    /// Number of rows written so far
    pub fn bars_written(&self) -> u64 {
        self.bars_written
    }
}

impl BarsWriter for CsvExportWriter {
    fn write_bar(&mut self, symbol: &str, bar: &Bar) -> OutputResult<()> {
        self.writer
            .serialize(ExportRecord::new(symbol, bar))
            .map_err(|e| OutputError::CsvError(format!("Failed to write bar: {e}")))?;

        self.bars_written += 1;
        if self.bars_written % 100_000 == 0 {
            debug!(rows = self.bars_written, "Export progress");
        }
        Ok(())
    }
}

impl OutputWriter for CsvExportWriter {
    fn flush(&mut self) -> OutputResult<()> {
        self.writer
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {e}")))
    }

    fn close(mut self) -> OutputResult<()> {
        self.flush()?;

        let buf_writer = self
            .writer
            .into_inner()
            .map_err(|e| OutputError::IoError(format!("Failed to get inner writer: {e}")))?;
        let file = buf_writer
            .into_inner()
            .map_err(|e| OutputError::IoError(format!("Failed to get file handle: {e}")))?;
        file.sync_all()
            .map_err(|e| OutputError::IoError(format!("Failed to sync file: {e}")))?;

        info!(rows = self.bars_written, "CSV export closed");
        Ok(())
    }
}
