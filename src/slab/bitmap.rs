//! Block-granularity in-use bitmap carried by every slab.
//!
//! One bit per 32 KiB block of a sliver. A read fault sets the bits naming
//! the blocks to fetch; the read-modify-write path then inverts the word so
//! the bits name the blocks the incoming bytes will overwrite; the
//! write-through path clears each block's bit as it reaches the backing
//! store.
//!
//! The word is atomic so it can live on the shared slab, but protocol-level
//! mutation (marking, inverting) is only ever performed by the thread that
//! owns the sliver's faulting state under the block-map lock.

use crate::types::BLOCKS_PER_SLIVER;
use std::sync::atomic::{AtomicU32, Ordering};

const _: () = assert!(BLOCKS_PER_SLIVER == 32);

const ALL_BLOCKS: u32 = u32::MAX;

/// In-use bitmap, one bit per block of one sliver.
#[derive(Debug, Default)]
pub struct BlockBitmap {
    bits: AtomicU32,
}

impl BlockBitmap {
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    pub fn set(&self, blk: usize) {
        debug_assert!(blk < BLOCKS_PER_SLIVER);
        self.bits.fetch_or(1u32 << blk, Ordering::Relaxed);
    }

    pub fn clear(&self, blk: usize) {
        debug_assert!(blk < BLOCKS_PER_SLIVER);
        self.bits.fetch_and(!(1u32 << blk), Ordering::Relaxed);
    }

    pub fn get(&self, blk: usize) -> bool {
        debug_assert!(blk < BLOCKS_PER_SLIVER);
        self.bits.load(Ordering::Relaxed) & (1u32 << blk) != 0
    }

    pub fn set_all(&self) {
        self.bits.store(ALL_BLOCKS, Ordering::Relaxed);
    }

    pub fn clear_all(&self) {
        self.bits.store(0, Ordering::Relaxed);
    }

    /// Flip every bit. After a read-modify-write fetch this turns "blocks
    /// to read" into "blocks about to be overwritten".
    pub fn invert(&self) {
        self.bits.fetch_xor(ALL_BLOCKS, Ordering::Relaxed);
    }

    pub fn count_set(&self) -> usize {
        self.bits.load(Ordering::Relaxed).count_ones() as usize
    }

    pub fn is_full(&self) -> bool {
        self.bits.load(Ordering::Relaxed) == ALL_BLOCKS
    }

    pub fn is_empty(&self) -> bool {
        self.bits.load(Ordering::Relaxed) == 0
    }

    pub fn snapshot(&self) -> u32 {
        self.bits.load(Ordering::Relaxed)
    }

    /// Contiguous runs of set bits as (first_block, block_count) pairs,
    /// lowest block first. Fetches coalesce along these runs.
    pub fn set_runs(&self) -> Vec<(usize, usize)> {
        let bits = self.bits.load(Ordering::Relaxed);
        let mut runs = Vec::new();
        let mut i = 0;
        while i < BLOCKS_PER_SLIVER {
            if bits & (1u32 << i) != 0 {
                let start = i;
                while i < BLOCKS_PER_SLIVER && bits & (1u32 << i) != 0 {
                    i += 1;
                }
                runs.push((start, i - start));
            } else {
                i += 1;
            }
        }
        runs
    }
}
