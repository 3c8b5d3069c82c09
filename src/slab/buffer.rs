//! A slab: one sliver's worth of cache memory plus its in-use bitmap.
//!
//! Slabs are pool-owned and recycled. The payload sits behind a read-write
//! lock so concurrent readers (client reads, CRC computation, write-through)
//! can share the buffer while a data-modifying copy takes it exclusively.
//! The bitmap rides alongside and is documented in [`super::bitmap`].

use super::bitmap::BlockBitmap;
use crate::types::SLIVER_SIZE;
use parking_lot::RwLock;

/// One sliver-sized cache buffer.
#[derive(Debug)]
pub struct Slab {
    data: RwLock<Box<[u8]>>,
    inuse: BlockBitmap,
}

impl Slab {
    /// Allocate a zero-filled slab. Zero fill is load-bearing: blocks the
    /// backing store never returned (holes, reads past EOF) must read back
    /// as zeroes.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(vec![0u8; SLIVER_SIZE].into_boxed_slice()),
            inuse: BlockBitmap::new(),
        }
    }

    pub fn inuse(&self) -> &BlockBitmap {
        &self.inuse
    }

    /// Copy `src` into the slab at byte offset `off`.
    pub fn copy_in(&self, off: usize, src: &[u8]) {
        debug_assert!(off + src.len() <= SLIVER_SIZE);
        let mut data = self.data.write();
        data[off..off + src.len()].copy_from_slice(src);
    }

    /// Copy `dst.len()` bytes out of the slab starting at byte offset `off`.
    pub fn copy_out(&self, off: usize, dst: &mut [u8]) {
        debug_assert!(off + dst.len() <= SLIVER_SIZE);
        let data = self.data.read();
        dst.copy_from_slice(&data[off..off + dst.len()]);
    }

    /// Run `f` over a byte range of the slab under the shared lock. Used by
    /// CRC computation and write-through, which need a consistent view
    /// without copying a megabyte.
    pub fn with_range<R>(&self, off: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        debug_assert!(off + len <= SLIVER_SIZE);
        let data = self.data.read();
        f(&data[off..off + len])
    }

    /// Exclusive variant of [`with_range`](Self::with_range); fetches read
    /// the backing store straight into the slab through this.
    pub fn with_range_mut<R>(&self, off: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(off + len <= SLIVER_SIZE);
        let mut data = self.data.write();
        f(&mut data[off..off + len])
    }

    /// Zero the payload and the bitmap before the slab goes back on the
    /// free list.
    pub fn reset(&self) {
        let mut data = self.data.write();
        data.fill(0);
        self.inuse.clear_all();
    }
}

impl Default for Slab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_in_out() {
        let slab = Slab::new();
        slab.copy_in(100, b"hello");
        let mut buf = [0u8; 5];
        slab.copy_out(100, &mut buf);
        assert_eq!(&buf, b"hello");
        // Untouched bytes stay zero.
        slab.copy_out(105, &mut buf);
        assert_eq!(buf, [0u8; 5]);
    }

    #[test]
    fn test_with_range() {
        let slab = Slab::new();
        slab.copy_in(0, &[1, 2, 3, 4]);
        let sum = slab.with_range(0, 4, |bytes| bytes.iter().map(|&b| b as u32).sum::<u32>());
        assert_eq!(sum, 10);
    }

    #[test]
    fn test_reset_clears_data_and_bits() {
        let slab = Slab::new();
        slab.copy_in(0, &[0xff; 64]);
        slab.inuse().set_all();
        slab.reset();
        let mut buf = [0xaau8; 64];
        slab.copy_out(0, &mut buf);
        assert_eq!(buf, [0u8; 64]);
        assert!(slab.inuse().is_empty());
    }
}
