//! Accumulating per-block outcomes into a final verdict.

use crate::{crypto::RunSeed, metadata::Mode};
use serde::Serialize;
use std::fmt;

/// Alias distances beyond this many are not tracked for the capacity probe.
const MAX_ALIAS_DISTANCES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Writing,
    Verifying,
    Probing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Writing => "writing",
            Phase::Verifying => "verifying",
            Phase::Probing => "probing",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoFailure {
    Read,
    Write,
    Timeout,
}

/// What reading back a single block revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BlockOutcome {
    /// The block holds exactly the pattern written for it.
    Honest,
    /// The block has no storage of its own: its address shares storage
    /// with the lower address `target`.
    Aliased { target: u64 },
    /// The block's storage was overwritten by a write meant for the higher
    /// address `by`.
    Displaced { by: u64 },
    /// The block matches no pattern written in this run.
    Corrupted,
    IoError { failure: IoFailure },
}

impl BlockOutcome {
    pub fn is_honest(&self) -> bool {
        matches!(self, BlockOutcome::Honest)
    }
}

/// One offending block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub offset: u64,
    pub outcome: BlockOutcome,
}

/// A count of blocks of one kind, plus the first few of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub count: u64,
    pub sample: Vec<Finding>,
}

impl Tally {
    /// Returns whether the finding was kept in the sample.
    fn add(&mut self, finding: Finding, limit: usize) -> bool {
        self.count += 1;
        if self.sample.len() < limit {
            self.sample.push(finding);
            true
        } else {
            false
        }
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.sample.first().map(|f| f.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum CapacityVerdict {
    /// No aliasing seen; the claimed size holds up.
    Nominal { capacity: u64 },
    /// Lowest aliased offset from the scan, without probing.
    Estimated { capacity: u64 },
    /// Located by the capacity probe. Unconfirmed when the probe could not
    /// reproduce the scan's evidence and fell back to the estimate.
    Probed {
        capacity: u64,
        probes: u32,
        confirmed: bool,
    },
    /// The run ended before anything could be concluded.
    Unknown,
}

impl CapacityVerdict {
    pub fn capacity(&self) -> Option<u64> {
        match *self {
            CapacityVerdict::Nominal { capacity }
            | CapacityVerdict::Estimated { capacity }
            | CapacityVerdict::Probed { capacity, .. } => Some(capacity),
            CapacityVerdict::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum Completion {
    Complete,
    Cancelled { phase: Phase, offset: u64 },
    Aborted { phase: Phase, offset: u64, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Honest,
    CapacityLie,
    Corrupted,
    Unreadable,
    Inconclusive,
}

impl Verdict {
    /// Process exit status for this verdict.
    pub fn exit_code(self) -> u8 {
        match self {
            Verdict::Honest => 0,
            Verdict::CapacityLie | Verdict::Corrupted | Verdict::Unreadable => 1,
            Verdict::Inconclusive => 2,
        }
    }
}

/// The immutable result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub seed: RunSeed,
    pub mode: Mode,
    pub block_size: u64,
    pub nominal_size: u64,
    pub extent: u64,
    pub blocks_verified: u64,
    pub bytes_verified: u64,
    pub honest: u64,
    pub aliased: Tally,
    pub displaced: Tally,
    pub corrupted: Tally,
    pub read_errors: Tally,
    pub write_errors: Tally,
    pub capacity: CapacityVerdict,
    pub completion: Completion,
    pub verdict: Verdict,
}

impl Report {
    pub fn true_capacity(&self) -> Option<u64> {
        self.capacity.capacity()
    }

    pub fn exit_code(&self) -> u8 {
        self.verdict.exit_code()
    }
}

/// What a report is about, fixed when the run starts.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub seed: RunSeed,
    pub mode: Mode,
    pub block_size: u64,
    pub nominal_size: u64,
    pub extent: u64,
}

/// Collects block outcomes as a run progresses.
#[derive(Debug)]
pub struct Aggregator {
    limit: usize,
    blocks_verified: u64,
    bytes_verified: u64,
    honest: u64,
    aliased: Tally,
    displaced: Tally,
    corrupted: Tally,
    read_errors: Tally,
    write_errors: Tally,
    lowest_aliased: Option<u64>,
    alias_distances: Vec<u64>,
}

impl Aggregator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            blocks_verified: 0,
            bytes_verified: 0,
            honest: 0,
            aliased: Tally::default(),
            displaced: Tally::default(),
            corrupted: Tally::default(),
            read_errors: Tally::default(),
            write_errors: Tally::default(),
            lowest_aliased: None,
            alias_distances: Vec::new(),
        }
    }

    /// Records the verification outcome of the `len`-byte block at `offset`.
    /// Returns whether it was kept as a sample finding.
    pub fn record(&mut self, offset: u64, len: usize, outcome: BlockOutcome) -> bool {
        self.blocks_verified += 1;
        self.bytes_verified += len as u64;
        let finding = Finding { offset, outcome };
        match outcome {
            BlockOutcome::Honest => {
                self.honest += 1;
                false
            }
            BlockOutcome::Aliased { target } => {
                self.lowest_aliased = Some(self.lowest_aliased.map_or(offset, |o| o.min(offset)));
                let distance = offset.abs_diff(target);
                if !self.alias_distances.contains(&distance)
                    && self.alias_distances.len() < MAX_ALIAS_DISTANCES
                {
                    self.alias_distances.push(distance);
                }
                self.aliased.add(finding, self.limit)
            }
            BlockOutcome::Displaced { .. } => self.displaced.add(finding, self.limit),
            BlockOutcome::Corrupted => self.corrupted.add(finding, self.limit),
            BlockOutcome::IoError { .. } => self.read_errors.add(finding, self.limit),
        }
    }

    /// Records a failed write. The block is still verified later.
    pub fn record_write_failure(&mut self, offset: u64, failure: IoFailure) -> bool {
        let finding = Finding {
            offset,
            outcome: BlockOutcome::IoError { failure },
        };
        self.write_errors.add(finding, self.limit)
    }

    pub fn lowest_aliased(&self) -> Option<u64> {
        self.lowest_aliased
    }

    /// Distinct distances between aliased blocks and the storage they share.
    pub fn alias_distances(&self) -> &[u64] {
        &self.alias_distances
    }

    pub fn finish(
        self,
        context: RunContext,
        completion: Completion,
        capacity: Option<CapacityVerdict>,
    ) -> Report {
        let complete = completion == Completion::Complete;
        let capacity = capacity.unwrap_or(match self.lowest_aliased {
            Some(offset) => CapacityVerdict::Estimated { capacity: offset },
            None if complete => CapacityVerdict::Nominal {
                capacity: context.extent,
            },
            None => CapacityVerdict::Unknown,
        });
        let verdict = if self.aliased.count > 0 || self.displaced.count > 0 {
            Verdict::CapacityLie
        } else if self.corrupted.count > 0 {
            Verdict::Corrupted
        } else if !complete {
            Verdict::Inconclusive
        } else if self.read_errors.count > 0 || self.write_errors.count > 0 {
            Verdict::Unreadable
        } else {
            Verdict::Honest
        };
        Report {
            seed: context.seed,
            mode: context.mode,
            block_size: context.block_size,
            nominal_size: context.nominal_size,
            extent: context.extent,
            blocks_verified: self.blocks_verified,
            bytes_verified: self.bytes_verified,
            honest: self.honest,
            aliased: self.aliased,
            displaced: self.displaced,
            corrupted: self.corrupted,
            read_errors: self.read_errors,
            write_errors: self.write_errors,
            capacity,
            completion,
            verdict,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn context() -> RunContext {
        RunContext {
            seed: RunSeed::new(9),
            mode: Mode::WriteVerify,
            block_size: 512,
            nominal_size: 512 * 100,
            extent: 512 * 100,
        }
    }

    #[test]
    fn honest_run() {
        let mut aggregator = Aggregator::new(4);
        for block in 0..100 {
            aggregator.record(block * 512, 512, BlockOutcome::Honest);
        }
        let report = aggregator.finish(context(), Completion::Complete, None);
        assert_eq!(report.verdict, Verdict::Honest);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.honest, 100);
        assert_eq!(report.bytes_verified, 51200);
        assert_eq!(report.true_capacity(), Some(51200));
    }

    #[test]
    fn caps_stored_findings() {
        let mut aggregator = Aggregator::new(3);
        let kept: Vec<bool> = (0..10)
            .map(|block| aggregator.record(block * 512, 512, BlockOutcome::Corrupted))
            .collect();
        assert_eq!(kept.iter().filter(|k| **k).count(), 3);
        let report = aggregator.finish(context(), Completion::Complete, None);
        assert_eq!(report.corrupted.count, 10);
        assert_eq!(report.corrupted.sample.len(), 3);
        assert_eq!(report.corrupted.first_offset(), Some(0));
        assert_eq!(report.verdict, Verdict::Corrupted);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn aliasing_estimates_capacity() {
        let mut aggregator = Aggregator::new(8);
        aggregator.record(0, 512, BlockOutcome::Displaced { by: 5120 });
        aggregator.record(5120, 512, BlockOutcome::Aliased { target: 0 });
        aggregator.record(5632, 512, BlockOutcome::Aliased { target: 512 });
        assert_eq!(aggregator.alias_distances(), &[5120]);
        assert_eq!(aggregator.lowest_aliased(), Some(5120));
        let report = aggregator.finish(context(), Completion::Complete, None);
        assert_eq!(report.verdict, Verdict::CapacityLie);
        assert_eq!(report.capacity, CapacityVerdict::Estimated { capacity: 5120 });
    }

    #[test]
    fn incomplete_runs_are_inconclusive() {
        let mut aggregator = Aggregator::new(8);
        aggregator.record(0, 512, BlockOutcome::Honest);
        aggregator.record(
            512,
            512,
            BlockOutcome::IoError {
                failure: IoFailure::Read,
            },
        );
        let report = aggregator.finish(
            context(),
            Completion::Aborted {
                phase: Phase::Verifying,
                offset: 1024,
                reason: "gone".to_string(),
            },
            None,
        );
        assert_eq!(report.verdict, Verdict::Inconclusive);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.capacity, CapacityVerdict::Unknown);
    }

    #[test]
    fn unreadable_blocks_fail_a_complete_run() {
        let mut aggregator = Aggregator::new(8);
        aggregator.record_write_failure(512, IoFailure::Write);
        aggregator.record(0, 512, BlockOutcome::Honest);
        let report = aggregator.finish(context(), Completion::Complete, None);
        assert_eq!(report.write_errors.count, 1);
        assert_eq!(report.verdict, Verdict::Unreadable);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn serializes_to_json() {
        let mut aggregator = Aggregator::new(8);
        aggregator.record(512, 512, BlockOutcome::Aliased { target: 0 });
        let report = aggregator.finish(context(), Completion::Complete, None);
        let json = serde_json::to_value(&report).expect("serializable");
        assert_eq!(json["verdict"], "capacity-lie");
        assert_eq!(json["aliased"]["sample"][0]["outcome"]["kind"], "aliased");
        assert_eq!(json["capacity"]["source"], "estimated");
        assert_eq!(json["seed"], 9);
    }
}
