//! Half-open millisecond intervals and coalesced coverage sets
//!
//! A [`CoverageSet`] is the bookkeeping unit of the cache: a sorted list of
//! non-overlapping, non-touching intervals. Inserting `[0, 10)` and `[10, 20)`
//! leaves a single `[0, 20)`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Timeframe;

/// Rejected interval bounds
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid interval: start {start} must be before end {end}")]
pub struct InvalidInterval {
    /// Requested start (ms)
    pub start: i64,
    /// Requested end (ms)
    pub end: i64,
}

/// Half-open `[start, end)` range of Unix milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    /// Inclusive start (ms)
    pub start: i64,
    /// Exclusive end (ms)
    pub end: i64,
}

impl Interval {
    /// Create a non-empty interval
    pub fn new(start: i64, end: i64) -> Result<Self, InvalidInterval> {
        if start >= end {
            return Err(InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// Length in milliseconds
    pub fn len_ms(&self) -> i64 {
        self.end - self.start
    }

    /// True when `start >= end`
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether `timestamp` lies inside the interval
    pub fn contains_ts(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    /// Whether `other` lies entirely inside this interval
    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the two intervals share at least one millisecond
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping or adjacent (the two would coalesce)
    pub fn touches(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Common part of the two intervals, if any
    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Interval { start, end })
    }

    /// Both bounds fall on `timeframe` boundaries
    pub fn is_aligned(&self, timeframe: Timeframe) -> bool {
        timeframe.is_aligned(self.start) && timeframe.is_aligned(self.end)
    }

    /// Number of bars of `timeframe` the interval holds
    pub fn bar_count(&self, timeframe: Timeframe) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.len_ms() / timeframe.to_milliseconds()) as usize
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            chrono::DateTime::from_timestamp_millis(self.start),
            chrono::DateTime::from_timestamp_millis(self.end),
        ) {
            (Some(start), Some(end)) => write!(
                f,
                "[{}, {})",
                start.format("%Y-%m-%dT%H:%M:%SZ"),
                end.format("%Y-%m-%dT%H:%M:%SZ")
            ),
            _ => write!(f, "[{}, {})", self.start, self.end),
        }
    }
}

/// Sorted, coalesced set of intervals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Interval>", into = "Vec<Interval>")]
pub struct CoverageSet {
    intervals: Vec<Interval>,
}

impl CoverageSet {
    /// Empty coverage
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a coverage set from arbitrary intervals, coalescing as needed
    pub fn from_intervals(intervals: impl IntoIterator<Item = Interval>) -> Self {
        let mut set = Self::new();
        for interval in intervals {
            set.insert(interval);
        }
        set
    }

    /// Covered intervals in ascending order
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// True when nothing is covered
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total covered milliseconds
    pub fn total_ms(&self) -> i64 {
        self.intervals.iter().map(Interval::len_ms).sum()
    }

    /// Merge `interval` into the set, coalescing with every neighbour it touches
    pub fn insert(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }

        // First interval whose end reaches the new start (adjacency counts)
        let first = self.intervals.partition_point(|iv| iv.end < interval.start);
        // One past the last interval whose start is within the new end
        let last = self.intervals.partition_point(|iv| iv.start <= interval.end);

        if first >= last {
            self.intervals.insert(first, interval);
            return;
        }

        let merged = Interval {
            start: interval.start.min(self.intervals[first].start),
            end: interval.end.max(self.intervals[last - 1].end),
        };
        self.intervals.splice(first..last, std::iter::once(merged));
    }

    /// `requested` minus the covered intervals: ascending, minimal, disjoint
    pub fn gaps(&self, requested: &Interval) -> Vec<Interval> {
        let mut gaps = Vec::new();
        if requested.is_empty() {
            return gaps;
        }

        let mut cursor = requested.start;
        let first = self.intervals.partition_point(|iv| iv.end <= requested.start);

        for covered in &self.intervals[first..] {
            if covered.start >= requested.end {
                break;
            }
            if covered.start > cursor {
                gaps.push(Interval {
                    start: cursor,
                    end: covered.start,
                });
            }
            cursor = cursor.max(covered.end);
            if cursor >= requested.end {
                break;
            }
        }

        if cursor < requested.end {
            gaps.push(Interval {
                start: cursor,
                end: requested.end,
            });
        }
        gaps
    }

    /// Covered parts of `requested`, ascending
    pub fn intersect(&self, requested: &Interval) -> Vec<Interval> {
        let first = self.intervals.partition_point(|iv| iv.end <= requested.start);
        self.intervals[first..]
            .iter()
            .take_while(|iv| iv.start < requested.end)
            .filter_map(|iv| iv.intersect(requested))
            .collect()
    }

    /// Whether `requested` lies entirely inside one covered interval
    pub fn covers(&self, requested: &Interval) -> bool {
        if requested.is_empty() {
            return true;
        }
        let idx = self.intervals.partition_point(|iv| iv.end <= requested.start);
        self.intervals
            .get(idx)
            .is_some_and(|iv| iv.contains(requested))
    }
}

impl From<Vec<Interval>> for CoverageSet {
    fn from(intervals: Vec<Interval>) -> Self {
        Self::from_intervals(intervals)
    }
}

impl From<CoverageSet> for Vec<Interval> {
    fn from(set: CoverageSet) -> Self {
        set.intervals
    }
}
