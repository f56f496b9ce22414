//! Finding the true capacity of a device that wraps writes around.
//!
//! The scan only shows *that* addresses share storage, and at which
//! distances. The prober bisects the address space, and at each candidate
//! block writes fresh patterns to the candidate and to the lower blocks it
//! could wrap onto (one or two per observed distance, depending on whether
//! the distance falls on a block boundary), candidate first. If the candidate
//! has no storage of its own, it no longer reads back as written. Partners
//! sit in the overwritten region, so blocks that verified honestly are left
//! alone.

use crate::{
    report::{BlockOutcome, CapacityVerdict},
    scan::ScanAbort,
};
use tracing::{debug, warn};

/// Writes and reads back a handful of blocks with patterns nobody has
/// seen before.
pub(crate) trait VerifyPrimitive {
    fn block_size(&self) -> u64;

    /// Writes fresh patterns to `offsets` in the given order, then reads
    /// them all back. Outcomes are in the order of `offsets`.
    fn probe(&mut self, offsets: &[u64]) -> Result<Vec<BlockOutcome>, ScanAbort>;
}

#[derive(Debug)]
pub(crate) struct CapacityProber {
    distances: Vec<u64>,
    probes: u32,
}

impl CapacityProber {
    /// `distances` are the gaps between aliased addresses and the lower
    /// addresses they share storage with.
    pub(crate) fn new(distances: Vec<u64>) -> Self {
        Self {
            distances,
            probes: 0,
        }
    }

    /// Upper bound on the probes `locate` needs when the scan saw aliasing
    /// from block `evidence` on.
    pub(crate) fn max_probes(evidence: u64) -> u64 {
        2 + u64::from(u64::BITS - evidence.leading_zeros())
    }

    /// Locates the lowest block without storage of its own, given the
    /// lowest aliased offset the scan found.
    pub(crate) fn locate<V: VerifyPrimitive>(
        mut self,
        target: &mut V,
        lowest_aliased: u64,
    ) -> Result<CapacityVerdict, ScanAbort> {
        let block_size = target.block_size();
        let evidence = lowest_aliased / block_size;

        if !self.holds_own_pattern(target, 0)? {
            warn!("The first block does not keep what is written to it; the device is unusable");
            return Ok(self.verdict(0, true));
        }
        if evidence == 0 || !self.is_aliased(target, evidence, block_size)? {
            warn!(lowest_aliased, "Could not reproduce the aliasing seen during the scan");
            return Ok(self.verdict(evidence * block_size, false));
        }

        // Block `lo` keeps its own data, block `hi` does not.
        let (mut lo, mut hi) = (0, evidence);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.is_aliased(target, mid, block_size)? {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Ok(self.verdict(hi * block_size, true))
    }

    fn verdict(&self, capacity: u64, confirmed: bool) -> CapacityVerdict {
        CapacityVerdict::Probed {
            capacity,
            probes: self.probes,
            confirmed,
        }
    }

    fn holds_own_pattern<V: VerifyPrimitive>(
        &mut self,
        target: &mut V,
        block: u64,
    ) -> Result<bool, ScanAbort> {
        self.probes += 1;
        let offset = block * target.block_size();
        let outcomes = target.probe(&[offset])?;
        Ok(outcomes.first().is_some_and(BlockOutcome::is_honest))
    }

    fn is_aliased<V: VerifyPrimitive>(
        &mut self,
        target: &mut V,
        block: u64,
        block_size: u64,
    ) -> Result<bool, ScanAbort> {
        let offset = block * block_size;
        let offsets = self.probe_set(offset, block_size);
        self.probes += 1;
        let outcomes = target.probe(&offsets)?;
        // The candidate was written first, so if any partner write landed on
        // its storage it no longer reads back as written.
        let aliased = outcomes.iter().zip(&offsets).any(|(outcome, &at)| match *outcome {
            BlockOutcome::Honest | BlockOutcome::IoError { .. } => false,
            _ if at == offset => true,
            BlockOutcome::Displaced { by } => by == offset,
            _ => false,
        });
        debug!(offset, partners = offsets.len() - 1, aliased, "Probed");
        Ok(aliased)
    }

    /// The candidate at `offset` followed by every block its data would
    /// overlap if it wrapped by one of the known distances. A distance that
    /// is not a multiple of the block size straddles two blocks.
    fn probe_set(&self, offset: u64, block_size: u64) -> Vec<u64> {
        let end = offset + block_size;
        let mut offsets = vec![offset];
        for &distance in self.distances.iter().filter(|&&distance| end > distance) {
            let first = offset.saturating_sub(distance) / block_size;
            let last = (end - distance - 1) / block_size;
            for partner in (first..=last).map(|block| block * block_size) {
                if partner < offset && !offsets.contains(&partner) {
                    offsets.push(partner);
                }
            }
        }
        offsets
    }
}
