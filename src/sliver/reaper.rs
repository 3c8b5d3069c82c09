//! Eviction under memory pressure.
//!
//! Reaping is split into a decide phase and an act phase to bound lock
//! hold times. Phase one snapshots the oldest LRU residents holding no
//! block-map lock at all. Phase two walks the snapshot with non-blocking
//! lock acquisition, so the reaper never stalls behind (or deadlocks
//! with) a thread that holds one block-map and wants another; each
//! candidate is re-verified under its lock before being marked. Phase
//! three recycles the collected slabs and finalizes the marks, again one
//! lock at a time.
//!
//! A slab-stripped sliver keeps its LRU spot and its slot-table entry;
//! the next pass over it finds a bare object and removes it entirely.
//! Between the mark and the finalize, lookups observe the `Freeing` state
//! and retry.

use crate::slab::Slab;
use crate::sliver::cache::Shared;
use crate::sliver::registry::SliverRef;
use crate::sliver::state::{QueuePos, SliverState};
use std::sync::Arc;
use tracing::{debug, trace};

/// Try to return `want` slabs to the pool. Returns how many made it; on a
/// shortfall every pool waiter is woken so it can retry rather than sleep
/// out its full patience.
pub(crate) fn reap(shared: &Shared, want: usize) -> usize {
    if want == 0 {
        return 0;
    }
    // Oversample: candidates that got touched, pinned or locked since the
    // snapshot drop out below.
    let candidates = shared.queues.oldest_lru(want * 4 + 8);
    trace!("reap pass: want {}, {} candidates", want, candidates.len());

    let mut strip: Vec<(SliverRef, Arc<Slab>)> = Vec::new();
    let mut remove: Vec<SliverRef> = Vec::new();
    for r in candidates {
        if strip.len() >= want {
            break;
        }
        let Some(mut guard) = r.bmap.try_lock() else {
            continue;
        };
        let Some(slot) = guard.slot_mut(r.slot) else {
            continue;
        };
        if slot.pos != QueuePos::Lru {
            continue;
        }
        if slot.slab_freeable() {
            slot.state = SliverState::SlabFreeing;
            if let Some(slab) = slot.slab.take() {
                strip.push((r.clone(), slab));
            }
        } else if slot.fully_freeable() {
            slot.state = SliverState::Freeing;
            shared.queues.unlink(slot);
            remove.push(r.clone());
        }
    }

    let freed = strip.len();
    if freed > 0 || !remove.is_empty() {
        debug!("reap: stripping {} slabs, removing {} bare slivers", freed, remove.len());
    }

    for (r, slab) in strip {
        shared.pool.put(slab);
        let mut guard = r.bmap.lock();
        if let Some(slot) = guard.slot_mut(r.slot) {
            debug_assert_eq!(slot.state, SliverState::SlabFreeing);
            slot.state = SliverState::New;
        }
        drop(guard);
        r.bmap.notify_all();
    }

    for r in remove {
        let mut guard = r.bmap.lock();
        if let Some(slot) = guard.slot(r.slot) {
            debug_assert_eq!(slot.state, SliverState::Freeing);
            debug_assert_eq!(slot.pins, 0);
        }
        guard.remove_slot(r.slot);
        drop(guard);
        shared.registry.remove_if_idle(&r.bmap);
    }

    if freed < want {
        shared.pool.wake_all();
    }
    freed
}
