//! Batching of captured digests into bounded transmission records.
//!
//! Each block-map owns at most one open batch accepting new digests. A
//! batch that reaches its pair cap detaches onto the ready queue; a quiet
//! one detaches once it ages past the flush bound. One transmission is in
//! flight at a time and carries ready batches first, then aged ones, oldest
//! first — the authority must see digests for a sliver in capture order. A
//! failed transmission puts every batch back at the front of the ready
//! queue unchanged.

use super::CrcSink;
use crate::sliver::queues::SliverQueues;
use crate::sliver::registry::{Bmap, SliverRef};
use crate::sliver::state::{QueuePos, SliverState};
use crate::types::{FileId, BATCHES_PER_PUSH, BATCH_MAX_PAIRS};
use crate::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One bounded record of (slot, digest) pairs for a single block-map.
#[derive(Clone)]
pub struct CrcBatch {
    bmap: Arc<Bmap>,
    fsize: u64,
    entries: Vec<(u16, u64)>,
    /// Refreshed on every append; age is measured from the last one.
    touched: Instant,
}

impl CrcBatch {
    fn new(bmap: Arc<Bmap>) -> Self {
        Self {
            bmap,
            fsize: 0,
            entries: Vec::with_capacity(BATCH_MAX_PAIRS),
            touched: Instant::now(),
        }
    }

    pub fn fid(&self) -> FileId {
        self.bmap.fid
    }

    pub fn bmapno(&self) -> u32 {
        self.bmap.bmapno
    }

    /// File length the cache believed when the newest digest was staged.
    pub fn fsize(&self) -> u64 {
        self.fsize
    }

    pub fn entries(&self) -> &[(u16, u64)] {
        &self.entries
    }

    pub fn age(&self) -> Duration {
        self.touched.elapsed()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= BATCH_MAX_PAIRS
    }
}

struct BatcherInner {
    open: HashMap<(FileId, u32), CrcBatch>,
    ready: VecDeque<CrcBatch>,
    inflight: bool,
}

/// Staging area between the CRC worker and the sink.
pub struct CrcBatcher {
    inner: Mutex<BatcherInner>,
    max_age: Duration,
}

impl CrcBatcher {
    pub fn new(max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(BatcherInner {
                open: HashMap::new(),
                ready: VecDeque::new(),
                inflight: false,
            }),
            max_age,
        }
    }

    /// Stage one captured digest. The caller has marked the sliver's
    /// `batch_pending` under its block-map lock, so a slot cannot be
    /// staged twice before the earlier record is acknowledged.
    pub(crate) fn stage(&self, r: &SliverRef, crc: u64, fsize: u64) {
        let mut inner = self.inner.lock();
        let key = (r.fid(), r.bmapno());
        let batch = inner
            .open
            .entry(key)
            .or_insert_with(|| CrcBatch::new(Arc::clone(&r.bmap)));
        debug_assert!(!batch.entries.iter().any(|&(slot, _)| slot == r.slot));
        batch.entries.push((r.slot, crc));
        batch.fsize = fsize;
        batch.touched = Instant::now();
        if batch.is_full() {
            let full = inner.open.remove(&key);
            if let Some(full) = full {
                debug!(
                    "crc batch full for fid={} bmapno={} ({} pairs), detached for push",
                    full.fid(),
                    full.bmapno(),
                    full.entries.len()
                );
                inner.ready.push_back(full);
            }
        }
    }

    /// Hand ready and aged batches to the sink, at most one transmission
    /// in flight. Returns how many batches went out.
    pub(crate) fn push_updates(&self, sink: &dyn CrcSink, queues: &SliverQueues) -> Result<usize> {
        let selected = {
            let mut inner = self.inner.lock();
            if inner.inflight {
                return Ok(0);
            }
            let mut selected = Vec::new();
            while selected.len() < BATCHES_PER_PUSH {
                match inner.ready.pop_front() {
                    Some(batch) => selected.push(batch),
                    None => break,
                }
            }
            if selected.len() < BATCHES_PER_PUSH {
                let aged: Vec<(FileId, u32)> = inner
                    .open
                    .iter()
                    .filter(|(_, batch)| batch.age() >= self.max_age)
                    .map(|(&key, _)| key)
                    .take(BATCHES_PER_PUSH - selected.len())
                    .collect();
                for key in aged {
                    if let Some(batch) = inner.open.remove(&key) {
                        selected.push(batch);
                    }
                }
            }
            if selected.is_empty() {
                return Ok(0);
            }
            inner.inflight = true;
            selected
        };

        match sink.push(&selected) {
            Ok(()) => {
                for batch in &selected {
                    Self::settle(batch, queues);
                }
                self.inner.lock().inflight = false;
                Ok(selected.len())
            }
            Err(e) => {
                // Put everything back in order so a later retry cannot
                // deliver a newer digest before an older one.
                let mut inner = self.inner.lock();
                for batch in selected.into_iter().rev() {
                    inner.ready.push_front(batch);
                }
                inner.inflight = false;
                Err(e)
            }
        }
    }

    /// Acknowledge one delivered batch: clear `batch_pending` on every
    /// slot it named, and requeue slots that were dirtied again while the
    /// record was outstanding — the dirty edge could not schedule them.
    fn settle(batch: &CrcBatch, queues: &SliverQueues) {
        let bmap = &batch.bmap;
        let mut guard = bmap.lock();
        let inner = &mut *guard;
        for &(slot_no, _) in batch.entries() {
            let Some(slot) = inner.slot_mut(slot_no) else {
                continue;
            };
            slot.batch_pending = false;
            let requeue = slot.crc_dirty
                && slot.pos == QueuePos::Lru
                && !slot.crcing
                && slot.state == SliverState::DataReady;
            if requeue {
                let r = SliverRef {
                    bmap: Arc::clone(bmap),
                    slot: slot_no,
                };
                queues.move_to_crcq(&r, slot);
                inner.crc_dirty_slivers += 1;
            }
        }
        drop(guard);
        bmap.notify_all();
    }

    pub fn open_batches(&self) -> usize {
        self.inner.lock().open.len()
    }

    pub fn ready_batches(&self) -> usize {
        self.inner.lock().ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::MemSink;

    fn make_ref(bmap: &Arc<Bmap>, slot: u16) -> SliverRef {
        SliverRef {
            bmap: Arc::clone(bmap),
            slot,
        }
    }

    #[test]
    fn test_stage_detaches_full_batch() {
        let batcher = CrcBatcher::new(Duration::from_secs(60));
        let bmap = Bmap::new(FileId(1), 0);
        for slot in 0..BATCH_MAX_PAIRS as u16 {
            batcher.stage(&make_ref(&bmap, slot), slot as u64, 0);
        }
        assert_eq!(batcher.open_batches(), 0);
        assert_eq!(batcher.ready_batches(), 1);
        // The next stage opens a fresh batch.
        batcher.stage(&make_ref(&bmap, 64), 64, 0);
        assert_eq!(batcher.open_batches(), 1);
    }

    #[test]
    fn test_push_skips_young_open_batches() {
        let batcher = CrcBatcher::new(Duration::from_secs(60));
        let queues = SliverQueues::new();
        let sink = MemSink::new();
        let bmap = Bmap::new(FileId(2), 1);
        batcher.stage(&make_ref(&bmap, 3), 0xabc, 100);
        let pushed = batcher.push_updates(&sink, &queues).expect("push");
        assert_eq!(pushed, 0);
        assert_eq!(batcher.open_batches(), 1);
        assert!(sink.updates().is_empty());
    }

    #[test]
    fn test_push_flushes_aged_batch() {
        let batcher = CrcBatcher::new(Duration::ZERO);
        let queues = SliverQueues::new();
        let sink = MemSink::new();
        let bmap = Bmap::new(FileId(3), 2);
        batcher.stage(&make_ref(&bmap, 7), 0x77, 4096);
        let pushed = batcher.push_updates(&sink, &queues).expect("push");
        assert_eq!(pushed, 1);
        let updates = sink.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].slot, 7);
        assert_eq!(updates[0].crc, 0x77);
        assert_eq!(updates[0].fsize, 4096);
        assert_eq!(updates[0].bmapno, 2);
    }

    #[test]
    fn test_failed_push_requeues_in_order() {
        let batcher = CrcBatcher::new(Duration::ZERO);
        let queues = SliverQueues::new();
        let sink = MemSink::new();
        let bmap_a = Bmap::new(FileId(4), 0);
        let bmap_b = Bmap::new(FileId(4), 1);
        for slot in 0..BATCH_MAX_PAIRS as u16 {
            batcher.stage(&make_ref(&bmap_a, slot), 1, 0);
        }
        for slot in 0..BATCH_MAX_PAIRS as u16 {
            batcher.stage(&make_ref(&bmap_b, slot), 2, 0);
        }
        assert_eq!(batcher.ready_batches(), 2);

        sink.set_fail(true);
        assert!(batcher.push_updates(&sink, &queues).is_err());
        assert_eq!(batcher.ready_batches(), 2);

        sink.set_fail(false);
        batcher.push_updates(&sink, &queues).expect("retry");
        let updates = sink.updates();
        // Region 0's digests still arrive before region 1's.
        assert_eq!(updates[0].bmapno, 0);
        assert_eq!(updates[BATCH_MAX_PAIRS].bmapno, 1);
    }

    #[test]
    fn test_settle_clears_pending_and_requeues_redirtied() {
        let batcher = CrcBatcher::new(Duration::ZERO);
        let queues = SliverQueues::new();
        let sink = MemSink::new();
        let bmap = Bmap::new(FileId(5), 0);
        {
            let mut inner = bmap.lock();
            let slot = inner.ensure_slot(9);
            slot.state = SliverState::DataReady;
            slot.batch_pending = true;
            slot.crc_dirty = true;
        }
        {
            let r = make_ref(&bmap, 9);
            let mut inner = bmap.lock();
            let slot = inner.slot_mut(9).expect("slot");
            queues.push_lru_tail(&r, slot);
        }
        batcher.stage(&make_ref(&bmap, 9), 0x9, 0);
        batcher.push_updates(&sink, &queues).expect("push");

        let inner = bmap.lock();
        let slot = inner.slot(9).expect("slot");
        assert!(!slot.batch_pending);
        assert_eq!(slot.pos, QueuePos::CrcQueue);
        assert_eq!(inner.crc_dirty_slivers, 1);
    }
}
