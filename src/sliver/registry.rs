//! Block-map objects and the process-wide block-map registry.
//!
//! A [`Bmap`] is the cache's view of one 128 MiB file region. It owns the
//! slot table for its 128 slivers and a single mutex guarding all of them;
//! sliver code locks the block-map, never individual slivers. The condvar
//! broadcasts every state transition so waiters parked on `GetSlab`,
//! `SlabFreeing` or `Faulting` windows can re-check.

use crate::crc::CrcTable;
use crate::sliver::state::SliverSlot;
use crate::types::{sliver_fileoff, FileId, SLIVERS_PER_BMAP};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One cached block-map region of one file.
pub struct Bmap {
    pub fid: FileId,
    pub bmapno: u32,
    inner: Mutex<BmapInner>,
    cond: Condvar,
}

/// Everything a block-map's mutex guards.
pub struct BmapInner {
    slots: Vec<Option<SliverSlot>>,
    /// Slivers of this region currently holding a spot on the CRC queue.
    pub crc_dirty_slivers: u32,
    /// Digests known to the metadata authority, updated locally as new
    /// ones are captured. Absent until installed.
    pub crc_table: Option<CrcTable>,
    /// High-water mark of write ends seen through this region, in absolute
    /// file offsets. Reported alongside digest updates as a size hint.
    pub fsize_hint: u64,
}

impl Bmap {
    pub fn new(fid: FileId, bmapno: u32) -> Arc<Self> {
        Arc::new(Self {
            fid,
            bmapno,
            inner: Mutex::new(BmapInner {
                slots: (0..SLIVERS_PER_BMAP).map(|_| None).collect(),
                crc_dirty_slivers: 0,
                crc_table: None,
                fsize_hint: 0,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, BmapInner> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, BmapInner>> {
        self.inner.try_lock()
    }

    /// Park until the next state broadcast. The guard is re-acquired on
    /// return; callers re-check their condition in a loop.
    pub fn wait(&self, guard: &mut MutexGuard<'_, BmapInner>) {
        self.cond.wait(guard);
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

impl fmt::Debug for Bmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bmap")
            .field("fid", &self.fid)
            .field("bmapno", &self.bmapno)
            .finish_non_exhaustive()
    }
}

impl BmapInner {
    pub fn slot(&self, slot: u16) -> Option<&SliverSlot> {
        self.slots[slot as usize].as_ref()
    }

    pub fn slot_mut(&mut self, slot: u16) -> Option<&mut SliverSlot> {
        self.slots[slot as usize].as_mut()
    }

    /// Slot accessor that creates a fresh `New` slot on first touch.
    pub fn ensure_slot(&mut self, slot: u16) -> &mut SliverSlot {
        self.slots[slot as usize].get_or_insert_with(SliverSlot::new)
    }

    pub fn remove_slot(&mut self, slot: u16) {
        self.slots[slot as usize] = None;
    }

    pub fn live_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Nothing cached and no digest work outstanding; the registry may
    /// drop this block-map.
    pub fn is_idle(&self) -> bool {
        self.crc_dirty_slivers == 0 && self.slots.iter().all(|s| s.is_none())
    }
}

/// Handle to one sliver: the owning block-map plus the slot number. All
/// state behind it lives under the block-map lock, so the handle itself is
/// freely clonable and may outlive the slot it names.
#[derive(Clone)]
pub struct SliverRef {
    pub bmap: Arc<Bmap>,
    pub slot: u16,
}

impl SliverRef {
    pub fn fid(&self) -> FileId {
        self.bmap.fid
    }

    pub fn bmapno(&self) -> u32 {
        self.bmap.bmapno
    }

    /// Absolute file offset of this sliver's first byte.
    pub fn fileoff(&self) -> u64 {
        sliver_fileoff(self.bmap.bmapno, self.slot)
    }

    pub fn same_sliver(&self, other: &SliverRef) -> bool {
        Arc::ptr_eq(&self.bmap, &other.bmap) && self.slot == other.slot
    }
}

impl fmt::Debug for SliverRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SliverRef(fid={}, bmapno={}, slot={})",
            self.bmap.fid, self.bmap.bmapno, self.slot
        )
    }
}

/// Process-wide table of live block-maps, keyed by file and region number.
///
/// Lock order: the registry map lock may be held while taking a block-map
/// lock, never the other way around.
#[derive(Default)]
pub struct BmapRegistry {
    bmaps: Mutex<BTreeMap<(FileId, u32), Arc<Bmap>>>,
}

impl BmapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, fid: FileId, bmapno: u32) -> Arc<Bmap> {
        let mut bmaps = self.bmaps.lock();
        Arc::clone(
            bmaps
                .entry((fid, bmapno))
                .or_insert_with(|| Bmap::new(fid, bmapno)),
        )
    }

    pub fn get(&self, fid: FileId, bmapno: u32) -> Option<Arc<Bmap>> {
        self.bmaps.lock().get(&(fid, bmapno)).cloned()
    }

    /// Drop the block-map from the table if it has gone idle. Returns
    /// whether it was removed.
    pub fn remove_if_idle(&self, bmap: &Arc<Bmap>) -> bool {
        let mut bmaps = self.bmaps.lock();
        let key = (bmap.fid, bmap.bmapno);
        match bmaps.get(&key) {
            Some(current) if Arc::ptr_eq(current, bmap) => {
                if bmap.lock().is_idle() {
                    bmaps.remove(&key);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.bmaps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bmaps.lock().is_empty()
    }
}
