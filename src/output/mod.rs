//! Export writers for loaded bar series

use crate::Bar;

pub mod csv;

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Buffer flush error
    #[error("flush error: {0}")]
    FlushError(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Generic output writer
pub trait OutputWriter {
    /// Flush any buffered data to disk
    fn flush(&mut self) -> OutputResult<()>;

    /// Close the writer and finalize output
    fn close(self) -> OutputResult<()>;
}

/// Writer of bars tagged with their symbol
pub trait BarsWriter: OutputWriter {
    /// Write a single bar of `symbol`
    fn write_bar(&mut self, symbol: &str, bar: &Bar) -> OutputResult<()>;

    /// Write a series of `symbol`
    fn write_bars(&mut self, symbol: &str, bars: &[Bar]) -> OutputResult<()> {
        for bar in bars {
            self.write_bar(symbol, bar)?;
        }
        Ok(())
    }
}
