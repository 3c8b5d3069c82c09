//! The CRC worker: drains the CRC queue, captures digests, and keeps the
//! batcher fed.
//!
//! A digest pass runs in one of two contexts. While a sliver is faulting,
//! the pass verifies the fetched bytes against the recorded digest. Once a
//! dirty sliver's writes have drained, the pass recomputes the digest,
//! records it, and stages it for transmission. Computation always happens
//! with the block-map lock released; a completed-write snapshot taken
//! before the pass detects payload changes that land mid-computation, in
//! which case the digest is discarded and the sliver requeued.

use crate::crc::{sliver_crc, CrcOutcome};
use crate::slab::Slab;
use crate::sliver::cache::{not_prepared, Shared};
use crate::sliver::registry::SliverRef;
use crate::sliver::state::{QueuePos, SliverState};
use crate::types::SLIVER_SIZE;
use crate::{Error, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Body of one CRC worker thread. Alternates between draining the queue
/// and pushing batched updates until shutdown.
pub(crate) fn worker_loop(shared: &Shared) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if let Some(r) = shared.queues.pop_crcq(shared.cfg.crcq_wait) {
            process_one(shared, &r);
        }
        match shared
            .batcher
            .push_updates(shared.sink.as_ref(), &shared.queues)
        {
            Ok(n) if n > 0 => trace!("pushed {} digest batches", n),
            Ok(_) => {}
            Err(e) => warn!("digest batch push failed: {}", e),
        }
    }
    trace!("crc worker exiting");
}

/// Handle one sliver popped off the CRC queue.
pub(crate) fn process_one(shared: &Shared, r: &SliverRef) {
    match recompute_pass(shared, r, true) {
        Ok(CrcOutcome::Stored(crc)) => trace!("captured digest {:#018x} for {:?}", crc, r),
        Ok(CrcOutcome::Raced) => debug!("digest pass on {:?} deferred, requeue pending", r),
        Ok(_) => {}
        Err(Error::NotPrepared { .. }) => trace!("stale digest queue entry for {:?}", r),
        Err(e) => warn!("digest pass on {:?} failed: {}", r, e),
    }
}

/// Run one digest pass over the sliver: verification while it is
/// faulting, recompute-and-stage when it is dirty and idle. `Raced`
/// covers a pass deferred by in-flight or mid-computation writes (the
/// sliver stays or lands back on a queue) and a pass already owned by
/// another thread.
pub(crate) fn do_crc(shared: &Shared, r: &SliverRef) -> Result<CrcOutcome> {
    {
        let guard = r.bmap.lock();
        let Some(slot) = guard.slot(r.slot) else {
            return Err(not_prepared(r));
        };
        if slot.state == SliverState::Faulting && !slot.crcing {
            let Some(slab) = slot.slab.as_ref().map(Arc::clone) else {
                return Err(not_prepared(r));
            };
            let expected = guard.crc_table.as_ref().and_then(|t| t.get(r.slot));
            drop(guard);
            return verify(shared, r, &slab, expected);
        }
    }
    recompute_pass(shared, r, false)
}

/// Verification context: compare freshly fetched bytes against the
/// recorded digest. A mismatch poisons the sliver; absence of a record
/// accepts the bytes unverified.
fn verify(
    shared: &Shared,
    r: &SliverRef,
    slab: &Arc<Slab>,
    expected: Option<u64>,
) -> Result<CrcOutcome> {
    let computed = slab.with_range(0, SLIVER_SIZE, sliver_crc);
    match expected {
        None => Ok(CrcOutcome::Unverified),
        Some(stored) if stored == computed => Ok(CrcOutcome::Verified),
        Some(stored) => {
            shared.poison(r);
            Err(Error::CrcMismatch {
                fid: r.fid(),
                bmapno: r.bmapno(),
                slot: r.slot,
                stored,
                computed,
            })
        }
    }
}

enum Action {
    /// Another pass owns the sliver right now.
    Busy,
    /// Not in a recomputable state: poisoned, clean, or already staged.
    Stale,
    /// Writes in flight; put it back on the LRU, the drain edge requeues.
    Deschedule,
    Compute { slab: Arc<Slab>, snapshot: u64 },
}

/// Recompute context. `from_queue` marks a ref freshly popped off the CRC
/// queue, whose queue spot (and dirty-counter slot) this pass inherits.
fn recompute_pass(shared: &Shared, r: &SliverRef, from_queue: bool) -> Result<CrcOutcome> {
    let mut guard = r.bmap.lock();
    let inner = &mut *guard;
    let mut took_queue_spot = from_queue;
    let action = {
        let Some(slot) = inner.slot_mut(r.slot) else {
            debug_assert!(!from_queue, "queued sliver vanished: {:?}", r);
            return Err(not_prepared(r));
        };
        if from_queue {
            debug_assert_eq!(slot.pos, QueuePos::CrcQueue);
            slot.pos = QueuePos::Off;
        } else if slot.pos == QueuePos::CrcQueue {
            // An on-demand pass steals the queued work item.
            shared.queues.unlink(slot);
            took_queue_spot = true;
        }

        if slot.crcing {
            Action::Busy
        } else if slot.state != SliverState::DataReady || !slot.crc_dirty || slot.batch_pending {
            if slot.slab.is_some() && slot.pos == QueuePos::Off {
                shared.queues.push_lru_tail(r, slot);
            }
            Action::Stale
        } else if slot.pending_writes > 0 {
            shared.queues.push_lru_tail(r, slot);
            Action::Deschedule
        } else {
            match slot.slab.as_ref().map(Arc::clone) {
                Some(slab) => {
                    slot.crcing = true;
                    slot.pins += 1;
                    Action::Compute {
                        slab,
                        snapshot: slot.compl_writes,
                    }
                }
                None => Action::Stale,
            }
        }
    };
    if took_queue_spot {
        inner.crc_dirty_slivers = inner.crc_dirty_slivers.saturating_sub(1);
    }
    drop(guard);

    let (slab, snapshot) = match action {
        Action::Busy => return Ok(CrcOutcome::Raced),
        Action::Stale => return Err(not_prepared(r)),
        Action::Deschedule => {
            debug!("writes pending on {:?}, digest descheduled", r);
            return Ok(CrcOutcome::Raced);
        }
        Action::Compute { slab, snapshot } => (slab, snapshot),
    };

    let crc = slab.with_range(0, SLIVER_SIZE, sliver_crc);

    let mut guard = r.bmap.lock();
    let inner = &mut *guard;
    let raced = {
        let Some(slot) = inner.slot_mut(r.slot) else {
            return Err(not_prepared(r));
        };
        slot.crcing = false;
        debug_assert!(slot.pins > 0);
        slot.pins -= 1;
        if slot.compl_writes != snapshot {
            // A write landed while we were computing; the digest is void.
            shared.queues.move_to_crcq(r, slot);
            true
        } else {
            slot.crc_dirty = false;
            slot.batch_pending = true;
            shared.queues.push_lru_tail(r, slot);
            false
        }
    };
    if raced {
        inner.crc_dirty_slivers += 1;
        drop(guard);
        r.bmap.notify_all();
        return Ok(CrcOutcome::Raced);
    }
    if let Some(table) = inner.crc_table.as_mut() {
        table.set(r.slot, crc);
    }
    let fsize = inner.fsize_hint;
    drop(guard);
    r.bmap.notify_all();
    // batch_pending is already set, so nothing else can stage this slot.
    shared.batcher.stage(r, crc, fsize);
    Ok(CrcOutcome::Stored(crc))
}
