//! Deterministic block payloads for a scan.

use crate::crypto::{BlockCodec, RunSeed};
use rayon::prelude::*;

/// Produces the payload every block of a scan is expected to hold.
///
/// Holds no per-offset state: the payload for an offset depends only on the
/// run seed, the offset and the length of the block.
#[derive(Debug, Clone)]
pub(crate) struct PatternGenerator {
    codec: BlockCodec,
    block_size: usize,
}

impl PatternGenerator {
    pub(crate) fn new(seed: RunSeed, block_size: usize) -> Self {
        Self {
            codec: BlockCodec::new(seed),
            block_size,
        }
    }

    pub(crate) fn codec(&self) -> &BlockCodec {
        &self.codec
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    /// Length of the block at `offset` when the scanned extent ends at
    /// `extent`; only the final block can be short.
    pub(crate) fn block_len(&self, offset: u64, extent: u64) -> usize {
        let remaining = extent.saturating_sub(offset);
        usize::try_from(remaining).map_or(self.block_size, |r| r.min(self.block_size))
    }

    pub(crate) fn expected(&self, offset: u64, len: usize) -> Vec<u8> {
        self.codec.encode_to_vec(offset, len)
    }

    /// Fills `buf` with the payloads of consecutive blocks starting at
    /// `first_offset`. The last chunk of `buf` may be short.
    pub(crate) fn fill_batch(&self, first_offset: u64, buf: &mut [u8]) {
        let block_size = self.block_size;
        buf.par_chunks_mut(block_size)
            .enumerate()
            .for_each(|(index, chunk)| {
                let offset = first_offset + (index * block_size) as u64;
                self.codec.encode(offset, chunk);
            });
    }
}

#[cfg(test)]
mod test {
    use super::PatternGenerator;
    use crate::crypto::RunSeed;

    #[test]
    fn batch_matches_single_blocks() {
        let generator = PatternGenerator::new(RunSeed::new(7), 512);
        let mut batch = vec![0; 512 * 5 + 100];
        generator.fill_batch(8192, &mut batch);
        for (index, chunk) in batch.chunks(512).enumerate() {
            let offset = 8192 + index as u64 * 512;
            assert_eq!(chunk, generator.expected(offset, chunk.len()).as_slice());
        }
    }

    #[test]
    fn final_block_is_short() {
        let generator = PatternGenerator::new(RunSeed::new(7), 4096);
        assert_eq!(generator.block_len(0, 1_000_000), 4096);
        assert_eq!(generator.block_len(999_424, 1_000_000), 576);
        assert_eq!(generator.block_len(1_000_000, 1_000_000), 0);
    }

    #[test]
    fn generation_is_stateless() {
        let generator = PatternGenerator::new(RunSeed::new(7), 512);
        let first = generator.expected(1024, 512);
        let _ = generator.expected(512, 512);
        assert_eq!(first, generator.expected(1024, 512));
    }
}
