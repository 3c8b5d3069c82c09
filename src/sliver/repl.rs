//! Replication transfer staking.
//!
//! A sliver serving as a replication source is an ordinary reader of
//! ready data: the stake counts a pending read and pins the sliver for
//! the transfer's lifetime. A destination claims the fault window
//! outright: incoming bytes fully overwrite the sliver, so there is no
//! read-before-write, the digest arrives from the source side already
//! computed, and a failed transfer is quarantined so partial bytes can
//! never surface as valid data.

use crate::crc::CrcTable;
use crate::sliver::cache::{data_error, not_prepared, Shared};
use crate::sliver::registry::SliverRef;
use crate::sliver::state::{ReplRole, SliverState};
use crate::{Error, Result};
use std::mem;
use tracing::{debug, info, warn};

/// How a replication transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplStatus {
    /// Transfer complete. For a destination the source's digest rides
    /// along and is recorded as-is, never recomputed locally.
    Done { digest: Option<u64> },
    /// Transfer failed or was called off.
    Aborted,
}

/// Stake the sliver for `role`. The stake holds its own pin, returned by
/// [`repl_done`]; the caller's lookup pin stays its own to settle.
///
/// A source must be data-ready and counts as one pending read for the
/// duration -- the transfer reads without a separate `io_prep`. A
/// destination waits for in-flight I/O and digest work to drain, then
/// moves to `Faulting` with the replication stake set; the payload write
/// goes through the ordinary `io_prep`/`write`/`io_done` path, which
/// recognizes the stake. Only one stake per sliver at a time.
pub(crate) fn repl_prep(r: &SliverRef, role: ReplRole) -> Result<()> {
    let mut guard = r.bmap.lock();
    loop {
        let slot = guard.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
        debug_assert!(slot.pins > 0, "repl_prep on unpinned {:?}", r);
        if slot.repl.is_some() {
            return Err(Error::ReplBusy {
                fid: r.fid(),
                bmapno: r.bmapno(),
                slot: r.slot,
            });
        }
        match role {
            ReplRole::Source => match slot.state {
                SliverState::DataReady => {
                    slot.repl = Some(ReplRole::Source);
                    slot.pending_reads += 1;
                    slot.pins += 1;
                    debug!("replication source staked on {:?}", r);
                    return Ok(());
                }
                SliverState::DataErr => return Err(data_error(r)),
                SliverState::Faulting => r.bmap.wait(&mut guard),
                _ => return Err(not_prepared(r)),
            },
            ReplRole::Destination => match slot.state {
                // A data-error destination is the repair path: the
                // incoming copy replaces the poisoned payload.
                SliverState::Empty | SliverState::DataReady | SliverState::DataErr => {
                    if slot.pending_reads > 0
                        || slot.pending_writes > 0
                        || slot.crcing
                        || slot.crc_dirty
                        || slot.batch_pending
                    {
                        // Drain first: a digest captured from the old
                        // payload must not trail the replacement.
                        r.bmap.wait(&mut guard);
                        continue;
                    }
                    slot.state = SliverState::Faulting;
                    slot.repl = Some(ReplRole::Destination);
                    slot.pins += 1;
                    debug!("replication destination staked on {:?}", r);
                    return Ok(());
                }
                SliverState::Faulting => r.bmap.wait(&mut guard),
                _ => return Err(not_prepared(r)),
            },
        }
    }
}

/// Settle a replication transfer and return the stake's pin.
pub(crate) fn repl_done(shared: &Shared, r: &SliverRef, status: ReplStatus) {
    let mut guard = r.bmap.lock();
    let inner = &mut *guard;
    let role = {
        let Some(slot) = inner.slot_mut(r.slot) else {
            debug_assert!(false, "repl_done on vanished {:?}", r);
            return;
        };
        slot.repl.take()
    };
    match role {
        Some(ReplRole::Source) => {
            drop(guard);
            if status == ReplStatus::Aborted {
                debug!("replication read from {:?} aborted", r);
            }
            // The stake counted one read and one pin; settle both the
            // way any read completion does.
            shared.rio_done(r);
        }
        Some(ReplRole::Destination) => match status {
            ReplStatus::Done { digest } => {
                let replies = {
                    let Some(slot) = inner.slot_mut(r.slot) else {
                        return;
                    };
                    debug_assert_eq!(slot.state, SliverState::Faulting);
                    debug_assert_eq!(slot.pending_writes, 0, "settle before writes drained");
                    slot.state = SliverState::DataReady;
                    slot.async_wait = false;
                    debug_assert!(slot.pins > 0);
                    slot.pins = slot.pins.saturating_sub(1);
                    mem::take(&mut slot.waiting_replies)
                };
                if let Some(crc) = digest {
                    inner
                        .crc_table
                        .get_or_insert_with(CrcTable::new)
                        .set(r.slot, crc);
                }
                drop(guard);
                r.bmap.notify_all();
                for reply in replies {
                    reply.complete(true);
                }
                info!("replication landed on {:?}", r);
            }
            ReplStatus::Aborted => {
                // Quarantine: drop the slab so the partial payload can
                // never surface, and put the slot back to square one.
                let (slab, replies) = {
                    let Some(slot) = inner.slot_mut(r.slot) else {
                        return;
                    };
                    debug_assert_eq!(slot.state, SliverState::Faulting);
                    slot.state = SliverState::New;
                    slot.async_wait = false;
                    debug_assert!(slot.pins > 0);
                    slot.pins = slot.pins.saturating_sub(1);
                    (slot.slab.take(), mem::take(&mut slot.waiting_replies))
                };
                drop(guard);
                r.bmap.notify_all();
                for reply in replies {
                    reply.complete(false);
                }
                if let Some(slab) = slab {
                    slab.inuse().clear_all();
                    shared.pool.put(slab);
                }
                warn!("replication to {:?} aborted, payload quarantined", r);
            }
        },
        None => {
            debug_assert!(false, "repl_done without a stake on {:?}", r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::crc::{sliver_crc, CrcSink, MemSink};
    use crate::sliver::cache::SliverCache;
    use crate::store::{BackingStore, MemStore};
    use crate::types::{FileId, Rw, SLIVER_SIZE};
    use std::sync::Arc;
    use std::time::Duration;

    fn repl_cache() -> (SliverCache, Arc<MemStore>, Arc<MemSink>) {
        let store = Arc::new(MemStore::new());
        let sink = Arc::new(MemSink::new());
        let cfg = CacheConfig {
            slab_count: 4,
            crc_workers: 0,
            fetch_workers: 0,
            async_faults: false,
            batch_max_age: Duration::from_millis(0),
            crcq_wait: Duration::from_millis(10),
            slab_wait: Duration::from_millis(10),
        };
        let cache = SliverCache::new(
            cfg,
            Arc::clone(&store) as Arc<dyn BackingStore>,
            Arc::clone(&sink) as Arc<dyn CrcSink>,
        )
        .expect("cache");
        (cache, store, sink)
    }

    fn fault_ready(cache: &SliverCache, fid: FileId, slot: u16) {
        let r = cache.lookup(fid, 0, slot, Rw::Read).expect("lookup");
        cache.slab_prep(&r).expect("slab");
        cache.io_prep(&r, 0, 64, Rw::Read).expect("prep");
        cache.io_done(&r, Rw::Read);
    }

    #[test]
    fn test_source_stake_reads_and_settles() {
        let (cache, store, _sink) = repl_cache();
        let fid = FileId(41);
        store.seed(fid, 0, &vec![0xaa; SLIVER_SIZE]);
        fault_ready(&cache, fid, 0);

        let r = cache.lookup(fid, 0, 0, Rw::Read).expect("lookup");
        cache.repl_prep(&r, ReplRole::Source).expect("stake");
        // One stake at a time.
        let err = cache.repl_prep(&r, ReplRole::Source).expect_err("double stake");
        assert!(matches!(err, Error::ReplBusy { .. }));

        let mut buf = [0u8; 128];
        cache.read(&r, 0, &mut buf).expect("read under stake");
        assert_eq!(buf, [0xaa; 128]);
        cache.repl_done(&r, ReplStatus::Done { digest: None });
        cache.release(&r);

        // Fully quiet again: the reaper can take it.
        assert_eq!(cache.reap(1), 1);
    }

    #[test]
    fn test_destination_overwrite_records_trusted_digest() {
        let (cache, store, _sink) = repl_cache();
        let fid = FileId(42);
        store.seed(fid, 0, &vec![0x01; SLIVER_SIZE]);
        fault_ready(&cache, fid, 0);

        let payload = vec![0x7f; SLIVER_SIZE];
        let r = cache.lookup(fid, 0, 0, Rw::Write).expect("lookup");
        cache.repl_prep(&r, ReplRole::Destination).expect("stake");
        cache
            .io_prep(&r, 0, SLIVER_SIZE as u32, Rw::Write)
            .expect("prep on staked destination");
        cache.write(&r, 0, &payload).expect("write");
        cache.io_done(&r, Rw::Write);
        cache.repl_done(
            &r,
            ReplStatus::Done {
                digest: Some(sliver_crc(&payload)),
            },
        );

        // No local digest work: the source's record is trusted.
        assert_eq!(cache.stats().crcq_len, 0);

        let r = cache.lookup(fid, 0, 0, Rw::Read).expect("lookup");
        cache.io_prep(&r, 0, 64, Rw::Read).expect("prep");
        let mut buf = [0u8; 64];
        cache.read(&r, 0, &mut buf).expect("read");
        assert_eq!(buf, [0x7f; 64]);
        cache.io_done(&r, Rw::Read);

        // Strip the slab and re-fault: the fetch must verify cleanly
        // against the recorded digest.
        assert_eq!(cache.reap(1), 1);
        let r = cache.lookup(fid, 0, 0, Rw::Read).expect("lookup");
        cache.slab_prep(&r).expect("slab");
        cache.io_prep(&r, 0, 64, Rw::Read).expect("verified refault");
        cache.io_done(&r, Rw::Read);
    }

    #[test]
    fn test_destination_abort_quarantines_partial_payload() {
        let (cache, _store, _sink) = repl_cache();
        let fid = FileId(43);
        let free_before = cache.stats().free_slabs;

        let r = cache.lookup(fid, 0, 0, Rw::Write).expect("lookup");
        cache.slab_prep(&r).expect("slab");
        cache.repl_prep(&r, ReplRole::Destination).expect("stake");
        cache.io_prep(&r, 0, 8192, Rw::Write).expect("prep");
        cache.write(&r, 0, &[0x55; 8192]).expect("partial chunk");
        cache.io_done(&r, Rw::Write);
        cache.repl_done(&r, ReplStatus::Aborted);

        // Slab returned, nothing readable left behind.
        assert_eq!(cache.stats().free_slabs, free_before);
        let r = cache.lookup(fid, 0, 0, Rw::Read).expect("lookup");
        let mut buf = [0u8; 16];
        let err = cache.read(&r, 0, &mut buf).expect_err("quarantined");
        assert!(matches!(err, Error::NotPrepared { .. }));
        cache.release(&r);
    }

    #[test]
    fn test_destination_repairs_poisoned_sliver() {
        let (cache, store, _sink) = repl_cache();
        let fid = FileId(44);
        store.set_fail_reads(true);
        let r = cache.lookup(fid, 0, 0, Rw::Read).expect("lookup");
        cache.slab_prep(&r).expect("slab");
        assert!(cache.io_prep(&r, 0, 64, Rw::Read).is_err());
        cache.release(&r);
        store.set_fail_reads(false);

        let payload = vec![0x33; SLIVER_SIZE];
        let r = cache.lookup(fid, 0, 0, Rw::Write).expect("lookup");
        cache.repl_prep(&r, ReplRole::Destination).expect("stake over data-error");
        cache
            .io_prep(&r, 0, SLIVER_SIZE as u32, Rw::Write)
            .expect("prep");
        cache.write(&r, 0, &payload).expect("write");
        cache.io_done(&r, Rw::Write);
        cache.repl_done(
            &r,
            ReplStatus::Done {
                digest: Some(sliver_crc(&payload)),
            },
        );

        let r = cache.lookup(fid, 0, 0, Rw::Read).expect("lookup");
        cache.io_prep(&r, 0, 64, Rw::Read).expect("repaired");
        let mut buf = [0u8; 64];
        cache.read(&r, 0, &mut buf).expect("read");
        assert_eq!(buf, [0x33; 64]);
        cache.io_done(&r, Rw::Read);
    }
}
