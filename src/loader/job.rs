//! Load job phases and progress

use std::time::Instant;

use super::LoadError;
use crate::coverage::Interval;

/// Phase of one `get` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    /// Computing gaps against the cache
    Planning,
    /// Fetching and committing gaps
    Filling,
    /// Reading the requested range back from the cache
    Assembling,
    /// Finished successfully
    Done,
    /// Some of the requested range could not be filled
    Failed,
}

impl LoadPhase {
    /// Whether `self -> next` is a legal transition
    ///
    /// Phases only move forward. Filling is skipped when nothing is missing.
    pub fn can_transition_to(self, next: LoadPhase) -> bool {
        use LoadPhase::*;
        matches!(
            (self, next),
            (Planning, Filling)
                | (Planning, Assembling)
                | (Filling, Assembling)
                | (Filling, Failed)
                | (Assembling, Done)
        )
    }

    /// Done or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadPhase::Done | LoadPhase::Failed)
    }
}

/// Progress of a single symbol load
#[derive(Debug)]
pub struct LoadJob {
    /// Symbol being loaded
    pub symbol: String,
    /// Requested range
    pub requested: Interval,
    /// Gaps found while planning
    pub gaps: Vec<Interval>,
    /// Bars newly committed to the cache
    pub committed_bars: usize,
    phase: LoadPhase,
    started: Instant,
}

impl LoadJob {
    /// Job in the Planning phase
    pub fn new(symbol: impl Into<String>, requested: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            requested,
            gaps: Vec::new(),
            committed_bars: 0,
            phase: LoadPhase::Planning,
            started: Instant::now(),
        }
    }

    /// Current phase
    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Move to `next`, rejecting backwards or skipping transitions
    pub fn advance(&mut self, next: LoadPhase) -> Result<(), LoadError> {
        if !self.phase.can_transition_to(next) {
            return Err(LoadError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Wall time since the job was created
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// What a load did for one symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    /// Symbol loaded
    pub symbol: String,
    /// Requested range
    pub requested: Interval,
    /// Gaps that had to be fetched
    pub gaps: Vec<Interval>,
    /// Bars newly committed to the cache
    pub committed_bars: usize,
}

impl From<&LoadJob> for LoadSummary {
    fn from(job: &LoadJob) -> Self {
        Self {
            symbol: job.symbol.clone(),
            requested: job.requested,
            gaps: job.gaps.clone(),
            committed_bars: job.committed_bars,
        }
    }
}
