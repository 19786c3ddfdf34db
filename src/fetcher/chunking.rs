//! Splitting gaps into exchange-call-sized chunks
//!
//! Chunk boundaries sit on a fixed grid (`k * max_limit * timeframe` from the
//! Unix epoch), so two overlapping requests for the same symbol always produce
//! identical chunks for their shared part. That is what lets the fetcher
//! deduplicate in-flight calls.

use crate::coverage::Interval;
use crate::Timeframe;

/// Width of one grid cell in milliseconds
pub fn grid_width(timeframe: Timeframe, max_limit: u32) -> i64 {
    timeframe.to_milliseconds() * i64::from(max_limit.max(1))
}

/// Grid cell containing `timestamp`
pub fn grid_cell(timestamp: i64, timeframe: Timeframe, max_limit: u32) -> Interval {
    let width = grid_width(timeframe, max_limit);
    let start = timestamp.div_euclid(width) * width;
    Interval {
        start,
        end: start + width,
    }
}

/// Split `gap` into grid-aligned chunks of at most `max_limit` bars
///
/// The first and last chunk are clipped to the gap; every other chunk is a
/// full grid cell.
pub fn split_into_chunks(gap: &Interval, timeframe: Timeframe, max_limit: u32) -> Vec<Interval> {
    let mut chunks = Vec::new();
    let mut current = gap.start;

    while current < gap.end {
        let cell = grid_cell(current, timeframe, max_limit);
        let end = cell.end.min(gap.end);
        chunks.push(Interval {
            start: current,
            end,
        });
        current = end;
    }

    chunks
}
