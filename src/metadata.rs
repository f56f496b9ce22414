//! Meta-information about a test run.

use crate::crypto::{RunSeed, MIN_PAYLOAD_LEN};
use serde::Serialize;
use std::time::Duration;

pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Overwrite the device, then read everything back.
    WriteVerify,
    /// Re-check a device written by an earlier run with the same seed.
    VerifyOnly,
}

#[derive(Debug, Clone)]
pub struct TestOptions {
    pub block_size: usize,
    pub seed: RunSeed,
    pub mode: Mode,
    /// Only test this many bytes from the start of the device.
    pub limit: Option<u64>,
    /// How many blocks to generate per batch during the write phase.
    pub batch_blocks: usize,
    /// How many offending blocks of each kind to keep in the report.
    pub max_findings: usize,
    /// Consecutive per-block failures after which the device counts as gone.
    pub max_consecutive_errors: u32,
    pub io_timeout: Duration,
    /// Search for the true capacity when aliasing shows up.
    pub probe: bool,
}

impl TestOptions {
    pub fn new(block_size: usize, seed: RunSeed, mode: Mode) -> anyhow::Result<Self> {
        if !block_size.is_power_of_two() || block_size < MIN_BLOCK_SIZE {
            anyhow::bail!(
                "Block size must be a power of two of at least {MIN_BLOCK_SIZE} bytes, not {block_size}"
            );
        }
        if block_size > MAX_BLOCK_SIZE {
            anyhow::bail!("Block size must not exceed {MAX_BLOCK_SIZE} bytes");
        }
        debug_assert!(block_size >= MIN_PAYLOAD_LEN);
        Ok(Self {
            block_size,
            seed,
            mode,
            limit: None,
            batch_blocks: 256,
            max_findings: 64,
            max_consecutive_errors: 32,
            io_timeout: Duration::from_secs(30),
            probe: true,
        })
    }

    /// The part of the device a scan covers: the claimed size, clamped to
    /// the configured limit.
    pub fn extent(&self, size_hint: u64) -> u64 {
        self.limit.map_or(size_hint, |limit| limit.min(size_hint))
    }
}
