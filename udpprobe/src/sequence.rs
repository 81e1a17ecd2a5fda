//! Per-stream sequence tracking: loss runs, duplicates and reordering.
//!
//! Sequence numbers are expected to increase by one per probe. A jump opens a
//! loss run (gap); further jumps while the run is open extend it; the first
//! probe arriving exactly one past its predecessor closes it. Any probe that
//! does not advance the stream is rejected without touching tracker state.
use std::collections::VecDeque;

/// A run of consecutively missing probes, closed when the stream is back in step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossRun {
    /// First missing sequence number.
    pub start_sequence: u32,
    pub length: u32,
    /// Wall-clock seconds when the run closed (zero while still open).
    pub end_timestamp: f64,
}

/// Why a probe was refused by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// Same sequence as the last accepted probe.
    Duplicate,
    /// Older than the last accepted probe.
    Reordered,
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::Duplicate => write!(f, "duplicate"),
            Anomaly::Reordered => write!(f, "out of order"),
        }
    }
}

/// Effect of an accepted probe on loss-run state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequenceOutcome {
    /// Exactly one past the previous probe, no run open.
    InOrder,
    /// A new run opened with `length` missing probes.
    GapOpened { start: u32, length: u32 },
    /// The open run grew by `added`; `length` is its new total.
    GapExtended { added: u32, length: u32 },
    /// The open run ended.
    GapClosed(LossRun),
}

#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last_accepted: u32,
    largest_seen: u32,
    accepted: u64,
    anomalies: u64,
    gap_events: u64,
    lost_in_closed_runs: u64,
    open_run: Option<LossRun>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks ordering without mutating state.
    pub fn check(&self, sequence: u32) -> Result<(), Anomaly> {
        if sequence == self.last_accepted && self.accepted > 0 {
            Err(Anomaly::Duplicate)
        } else if sequence <= self.last_accepted {
            Err(Anomaly::Reordered)
        } else {
            Ok(())
        }
    }

    /// Accepts `sequence` if it advances the stream and updates loss-run state.
    pub fn observe(&mut self, sequence: u32, now: f64) -> Result<SequenceOutcome, Anomaly> {
        if let Err(anomaly) = self.check(sequence) {
            self.anomalies += 1;
            return Err(anomaly);
        }

        // check() guarantees sequence > last_accepted
        let gap = sequence - self.last_accepted - 1;
        let outcome = if gap == 0 {
            match self.open_run.take() {
                None => SequenceOutcome::InOrder,
                Some(mut run) => {
                    run.end_timestamp = now;
                    self.lost_in_closed_runs += run.length as u64;
                    SequenceOutcome::GapClosed(run)
                }
            }
        } else if let Some(run) = self.open_run.as_mut() {
            run.length = run.length.saturating_add(gap);
            SequenceOutcome::GapExtended {
                added: gap,
                length: run.length,
            }
        } else {
            let start = self.last_accepted + 1;
            self.gap_events += 1;
            self.open_run = Some(LossRun {
                start_sequence: start,
                length: gap,
                end_timestamp: 0.0,
            });
            SequenceOutcome::GapOpened { start, length: gap }
        };

        self.last_accepted = sequence;
        self.largest_seen = self.largest_seen.max(sequence);
        self.accepted += 1;
        Ok(outcome)
    }

    pub fn last_accepted(&self) -> u32 {
        self.last_accepted
    }

    pub fn largest_seen(&self) -> u32 {
        self.largest_seen
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Number of loss runs opened.
    pub fn gap_events(&self) -> u64 {
        self.gap_events
    }

    /// Probes lost in runs that have closed.
    pub fn total_lost(&self) -> u64 {
        self.lost_in_closed_runs
    }

    pub fn open_run(&self) -> Option<&LossRun> {
        self.open_run.as_ref()
    }
}

/// Bounded history of closed loss runs; the oldest entry is dropped when full.
#[derive(Debug, Clone)]
pub struct LossRunLog {
    runs: VecDeque<LossRun>,
    capacity: usize,
    overflowed: u64,
}

impl LossRunLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            runs: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            overflowed: 0,
        }
    }

    pub fn push(&mut self, run: LossRun) {
        if self.capacity == 0 {
            self.overflowed += 1;
            return;
        }
        if self.runs.len() == self.capacity {
            self.runs.pop_front();
            self.overflowed += 1;
        }
        self.runs.push_back(run);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LossRun> {
        self.runs.iter()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Runs discarded because the log was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }
}
