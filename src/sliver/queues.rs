//! The two sliver queues: LRU and the CRC work queue.
//!
//! Both live under one mutex and are ordered by an insertion sequence, so
//! "oldest first" is just ascending key order. A sliver is on at most one
//! queue; its `pos`/`queue_seq` fields mirror membership and are updated
//! here so list state and slot state cannot drift apart.
//!
//! Lock order: a block-map lock may be held while calling in, never
//! acquired while the queue lock is held. [`pop_crcq`](SliverQueues::pop_crcq)
//! hands back a ref whose slot still says `CrcQueue`; the worker reconciles
//! that under the block-map lock as its first step.

use crate::sliver::registry::SliverRef;
use crate::sliver::state::{QueuePos, SliverSlot};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::time::Duration;

struct QueuesInner {
    lru: BTreeMap<u64, SliverRef>,
    crcq: BTreeMap<u64, SliverRef>,
    next_seq: u64,
}

pub struct SliverQueues {
    inner: Mutex<QueuesInner>,
    crcq_ready: Condvar,
}

impl SliverQueues {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueuesInner {
                lru: BTreeMap::new(),
                crcq: BTreeMap::new(),
                next_seq: 0,
            }),
            crcq_ready: Condvar::new(),
        }
    }

    /// Put a sliver at the LRU tail (most recently used end).
    pub fn push_lru_tail(&self, r: &SliverRef, slot: &mut SliverSlot) {
        let mut inner = self.inner.lock();
        Self::unlink_inner(&mut inner, slot);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.lru.insert(seq, r.clone());
        slot.pos = QueuePos::Lru;
        slot.queue_seq = seq;
    }

    /// Freshen a sliver's LRU position after a touch.
    pub fn requeue_lru(&self, r: &SliverRef, slot: &mut SliverSlot) {
        self.push_lru_tail(r, slot);
    }

    /// Move a sliver onto the CRC queue and wake the worker.
    pub fn move_to_crcq(&self, r: &SliverRef, slot: &mut SliverSlot) {
        let mut inner = self.inner.lock();
        Self::unlink_inner(&mut inner, slot);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.crcq.insert(seq, r.clone());
        slot.pos = QueuePos::CrcQueue;
        slot.queue_seq = seq;
        drop(inner);
        self.crcq_ready.notify_one();
    }

    /// Take a sliver off whichever queue it is on.
    pub fn unlink(&self, slot: &mut SliverSlot) {
        let mut inner = self.inner.lock();
        Self::unlink_inner(&mut inner, slot);
    }

    fn unlink_inner(inner: &mut QueuesInner, slot: &mut SliverSlot) {
        match slot.pos {
            QueuePos::Lru => {
                inner.lru.remove(&slot.queue_seq);
            }
            QueuePos::CrcQueue => {
                inner.crcq.remove(&slot.queue_seq);
            }
            QueuePos::Off => {}
        }
        slot.pos = QueuePos::Off;
    }

    /// Dequeue the oldest CRC-queue entry, waiting up to `timeout` for one
    /// to appear. The returned slot's `pos` still reads `CrcQueue`.
    pub fn pop_crcq(&self, timeout: Duration) -> Option<SliverRef> {
        let mut inner = self.inner.lock();
        if inner.crcq.is_empty() {
            self.crcq_ready.wait_for(&mut inner, timeout);
        }
        inner.crcq.pop_first().map(|(_, r)| r)
    }

    /// Oldest `limit` LRU residents, least recently used first. A snapshot
    /// for the reaper; entries may move before it re-checks them.
    pub fn oldest_lru(&self, limit: usize) -> Vec<SliverRef> {
        self.inner
            .lock()
            .lru
            .values()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn lru_len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn crcq_len(&self) -> usize {
        self.inner.lock().crcq.len()
    }

    /// Wake anything parked in [`pop_crcq`](Self::pop_crcq), used at
    /// shutdown.
    pub fn wake_all(&self) {
        self.crcq_ready.notify_all();
    }
}

impl Default for SliverQueues {
    fn default() -> Self {
        Self::new()
    }
}
