//! Routines for generating self-describing, verifiable block payloads.
//!
//! Every payload written to the device is bound to its logical byte offset:
//!
//! | bytes        | content                                               |
//! |--------------|-------------------------------------------------------|
//! | `0..8`       | magic `b"HONESTBT"`                                   |
//! | `8..16`      | run seed, little-endian                               |
//! | `16..24`     | logical byte offset, little-endian                    |
//! | `24..28`     | payload length, little-endian `u32`                   |
//! | `28..32`     | reserved (zero)                                       |
//! | `32..L-32`   | filler: keyed blake3 XOF over the offset              |
//! | `L-32..L`    | keyed blake3 checksum over everything before it       |
//!
//! Payloads shorter than [`MIN_PAYLOAD_LEN`] (only ever a short final block)
//! are filler all the way through and can only be checked by comparison.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::{fmt, num::ParseIntError, str::FromStr};
use thiserror::Error;

pub(crate) const MAGIC: [u8; 8] = *b"HONESTBT";
pub(crate) const HEADER_LEN: usize = 32;
pub(crate) const CHECKSUM_LEN: usize = blake3::OUT_LEN;
pub(crate) const MIN_PAYLOAD_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// The per-run value that makes payloads of one run distinguishable from
/// any other run's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunSeed(u64);

impl RunSeed {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Picks a fresh seed for a new run.
    pub fn random() -> Self {
        Self(thread_rng().gen())
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Derives an independent seed for the given round, used for probe
    /// writes that must never be confused with the scan's own patterns.
    pub fn derive(self, round: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(self.0);
        rng.set_stream(round.wrapping_add(1));
        Self(rng.next_u64())
    }
}

impl fmt::Display for RunSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Accepts either a `0x`-prefixed hex value (as printed) or a decimal one.
impl FromStr for RunSeed {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).map(Self::new),
            None => s.parse().map(Self::new),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload of {len} bytes is too short to carry an address header")]
    TooShort { len: usize },

    #[error("payload checksum does not match its contents")]
    CorruptPayload,

    #[error("payload was written by a different run (seed {found:#018x})")]
    ForeignRun { found: u64 },

    #[error("payload declares {declared} bytes but {actual} were read")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Encodes and decodes block payloads for one run seed.
#[derive(Clone)]
pub(crate) struct BlockCodec {
    seed: RunSeed,
    checksum_key: [u8; 32],
    filler_key: [u8; 32],
}

impl fmt::Debug for BlockCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCodec").field("seed", &self.seed).finish()
    }
}

impl BlockCodec {
    pub(crate) fn new(seed: RunSeed) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.value());
        let mut checksum_key = [0; 32];
        let mut filler_key = [0; 32];
        rng.fill_bytes(&mut checksum_key);
        rng.fill_bytes(&mut filler_key);
        Self {
            seed,
            checksum_key,
            filler_key,
        }
    }

    /// Fills `out` with the payload for the block at `offset`. The payload
    /// length is the length of `out`.
    pub(crate) fn encode(&self, offset: u64, out: &mut [u8]) {
        let len = out.len();
        if len < MIN_PAYLOAD_LEN {
            self.fill(offset, out);
            return;
        }
        let declared = u32::try_from(len).unwrap_or(u32::MAX);
        out[0..8].copy_from_slice(&MAGIC);
        out[8..16].copy_from_slice(&self.seed.value().to_le_bytes());
        out[16..24].copy_from_slice(&offset.to_le_bytes());
        out[24..28].copy_from_slice(&declared.to_le_bytes());
        out[28..HEADER_LEN].fill(0);

        let body_end = len - CHECKSUM_LEN;
        self.fill(offset, &mut out[HEADER_LEN..body_end]);
        let checksum = blake3::keyed_hash(&self.checksum_key, &out[..body_end]);
        out[body_end..].copy_from_slice(checksum.as_bytes());
    }

    pub(crate) fn encode_to_vec(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.encode(offset, &mut buf);
        buf
    }

    /// Validates a payload read back from the device and returns the offset
    /// it was written for.
    pub(crate) fn decode(&self, payload: &[u8]) -> Result<u64, DecodeError> {
        let len = payload.len();
        if len < MIN_PAYLOAD_LEN {
            return Err(DecodeError::TooShort { len });
        }
        let body_end = len - CHECKSUM_LEN;
        let mut stored = [0; CHECKSUM_LEN];
        stored.copy_from_slice(&payload[body_end..]);
        let computed = blake3::keyed_hash(&self.checksum_key, &payload[..body_end]);
        if computed != blake3::Hash::from(stored) {
            return Err(match header_seed(payload) {
                Some(found) if found != self.seed.value() => DecodeError::ForeignRun { found },
                _ => DecodeError::CorruptPayload,
            });
        }

        let declared = read_u32(&payload[24..28]) as usize;
        if declared != len {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: len,
            });
        }
        Ok(read_u64(&payload[16..24]))
    }

    /// Looks for the header of another block of this run starting somewhere
    /// after the first byte of `payload`, as left behind by a write that
    /// landed off a block boundary. Returns its position in `payload`, the
    /// offset it was written for and its declared length.
    ///
    /// Only the header is checked, since the rest of that payload is cut off.
    pub(crate) fn find_header(&self, payload: &[u8]) -> Option<(usize, u64, usize)> {
        let mut tag = [0; 16];
        tag[..8].copy_from_slice(&MAGIC);
        tag[8..].copy_from_slice(&self.seed.value().to_le_bytes());
        let last = payload.len().checked_sub(HEADER_LEN)?;
        (1..=last)
            .filter(|&at| payload[at..at + tag.len()] == tag)
            .find(|&at| payload[at + 28..at + HEADER_LEN].iter().all(|&b| b == 0))
            .map(|at| {
                let header = &payload[at..at + HEADER_LEN];
                (at, read_u64(&header[16..24]), read_u32(&header[24..28]) as usize)
            })
    }

    fn fill(&self, offset: u64, out: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_keyed(&self.filler_key);
        hasher.update(&offset.to_le_bytes());
        hasher.finalize_xof().fill(out);
    }
}

/// The seed named in a payload header, if the payload looks like one of ours.
fn header_seed(payload: &[u8]) -> Option<u64> {
    (payload.len() >= HEADER_LEN && payload[0..8] == MAGIC).then(|| read_u64(&payload[8..16]))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
