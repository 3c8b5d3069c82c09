//! Core identifiers and sizing constants.
//!
//! Block-map regions are carved into fixed-size slivers, and slivers into
//! fixed-size blocks tracked by the in-use bitmap. All three sizes are
//! protocol constants shared with the metadata authority, not tunables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bytes per sliver (1 MiB).
pub const SLIVER_SIZE: usize = 1 << 20;

/// Bytes per in-use-bitmap block (32 KiB).
pub const BLOCK_SIZE: usize = 32 << 10;

/// Blocks tracked by one sliver's bitmap.
pub const BLOCKS_PER_SLIVER: usize = SLIVER_SIZE / BLOCK_SIZE;

/// Bytes per block-map region (128 MiB).
pub const BMAP_SIZE: u64 = 128 << 20;

/// Slivers per block-map region.
pub const SLIVERS_PER_BMAP: u16 = (BMAP_SIZE / SLIVER_SIZE as u64) as u16;

/// (slot, digest) pairs one CRC batch record can carry.
pub const BATCH_MAX_PAIRS: usize = 64;

/// Batch records one transmission push may hand to the sink.
pub const BATCHES_PER_PUSH: usize = 64;

/// Staleness bound on an open batch before an age-based flush.
pub const BATCH_MAX_AGE: Duration = Duration::from_secs(2);

const _: () = assert!(SLIVER_SIZE % BLOCK_SIZE == 0);
const _: () = assert!(BMAP_SIZE % SLIVER_SIZE as u64 == 0);

/// File identity as assigned by the metadata authority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Direction of an I/O operation against a sliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rw {
    Read,
    Write,
}

/// Absolute file offset of sliver `slot` within block-map `bmapno`.
pub fn sliver_fileoff(bmapno: u32, slot: u16) -> u64 {
    bmapno as u64 * BMAP_SIZE + slot as u64 * SLIVER_SIZE as u64
}
