//! The sliver cache: lookup, slab attach, fault-in, write-through and
//! completion accounting, tied together over the shared queues, pool,
//! batcher and async bridge.
//!
//! # Locking
//!
//! Every sliver lives under its block-map's mutex. The cache-wide
//! structures have their own locks and are ordered after it: a thread may
//! take `registry -> bmap -> queues` or `bmap -> batcher`, never the
//! reverse, and never queues and batcher together. Backing-store I/O and
//! digest computation always run with the block-map lock released; the
//! `Faulting` state keeps other parties out of the slab meanwhile.

use crate::aio::{AioBridge, AioReply, FetchReq};
use crate::config::CacheConfig;
use crate::crc::{CrcBatcher, CrcOutcome, CrcSink, CrcTable};
use crate::slab::{Slab, SlabPool};
use crate::sliver::queues::SliverQueues;
use crate::sliver::reaper;
use crate::sliver::registry::{BmapRegistry, SliverRef};
use crate::sliver::repl::{self, ReplStatus};
use crate::sliver::state::{QueuePos, ReplRole, SliverSlot, SliverState};
use crate::store::BackingStore;
use crate::types::{FileId, Rw, BLOCKS_PER_SLIVER, BLOCK_SIZE, SLIVERS_PER_BMAP, SLIVER_SIZE};
use crate::{crc, Error, Result};
use parking_lot::Mutex;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// How an I/O preparation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepOutcome {
    /// The sliver is ready; the operation is counted and may proceed.
    Ready,
    /// The fault went down the async bridge. The caller's reply token
    /// fires when it settles; re-prepare afterwards.
    WouldBlock,
}

/// State shared between the cache front end and its worker threads.
pub(crate) struct Shared {
    pub(crate) registry: BmapRegistry,
    pub(crate) queues: SliverQueues,
    pub(crate) pool: SlabPool,
    pub(crate) batcher: CrcBatcher,
    pub(crate) store: Arc<dyn BackingStore>,
    pub(crate) sink: Arc<dyn CrcSink>,
    pub(crate) bridge: AioBridge,
    pub(crate) cfg: CacheConfig,
    pub(crate) shutdown: AtomicBool,
}

/// Counters snapshot for introspection and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub free_slabs: usize,
    pub lru_len: usize,
    pub crcq_len: usize,
    pub bmaps: usize,
    pub open_batches: usize,
    pub ready_batches: usize,
}

/// The sliver cache engine. One instance owns the slab pool, the queues,
/// the digest batcher and the background threads.
pub struct SliverCache {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SliverCache {
    /// Build a cache over `store`, pushing digest updates into `sink`, and
    /// start the configured worker threads.
    pub fn new(
        cfg: CacheConfig,
        store: Arc<dyn BackingStore>,
        sink: Arc<dyn CrcSink>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            registry: BmapRegistry::new(),
            queues: SliverQueues::new(),
            pool: SlabPool::new(cfg.slab_count),
            batcher: CrcBatcher::new(cfg.batch_max_age),
            store,
            sink,
            bridge: AioBridge::new(),
            shutdown: AtomicBool::new(false),
            cfg,
        });

        let mut threads = Vec::new();
        for i in 0..shared.cfg.crc_workers {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("crc-worker-{}", i))
                .spawn(move || crc::worker::worker_loop(&worker_shared))?;
            threads.push(handle);
        }
        if shared.cfg.async_faults {
            threads.extend(crate::aio::spawn(&shared)?);
        }
        info!(
            "sliver cache up: {} slabs, {} crc workers, async faults {}",
            shared.cfg.slab_count, shared.cfg.crc_workers, shared.cfg.async_faults
        );
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Fail fast once shutdown has begun. Completion calls (`io_done`,
    /// `release`, `repl_done`) stay open so in-flight operations can
    /// settle and return their pins.
    fn ensure_open(&self) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Pin the sliver at `(fid, bmapno, slot)`, creating its block-map and
    /// slot entry on first touch. The pin is consumed by `io_done` (or
    /// `repl_done`); a caller that stops earlier returns it with
    /// [`release`](Self::release).
    ///
    /// A slot caught mid-removal by the reaper is retried until the old
    /// entry is gone and a fresh one can take its place.
    pub fn lookup(&self, fid: FileId, bmapno: u32, slot: u16, rw: Rw) -> Result<SliverRef> {
        self.ensure_open()?;
        if slot >= SLIVERS_PER_BMAP {
            return Err(Error::OutOfBounds {
                off: u64::from(slot),
                len: 1,
                max: u64::from(SLIVERS_PER_BMAP),
            });
        }
        loop {
            let bmap = self.shared.registry.get_or_create(fid, bmapno);
            let r = SliverRef { bmap, slot };
            let mut guard = r.bmap.lock();
            let entry = guard.ensure_slot(slot);
            if entry.state == SliverState::Freeing {
                // Reaper is mid-removal; let it finish and insert fresh.
                drop(guard);
                thread::yield_now();
                continue;
            }
            entry.pins += 1;
            let pins = entry.pins;
            drop(guard);
            trace!(
                "lookup fid={} bmapno={} slot={} rw={:?} pins={}",
                fid, bmapno, slot, rw, pins
            );
            return Ok(r);
        }
    }

    /// Return a lookup pin without performing I/O.
    pub fn release(&self, r: &SliverRef) {
        let mut guard = r.bmap.lock();
        if let Some(slot) = guard.slot_mut(r.slot) {
            debug_assert!(slot.pins > 0, "release of unpinned {:?}", r);
            slot.pins = slot.pins.saturating_sub(1);
        } else {
            debug_assert!(false, "release of vanished {:?}", r);
        }
    }

    /// Make sure the sliver has a slab attached, taking one from the pool
    /// (and running the reaper) if needed. Idempotent: a sliver that
    /// already owns a slab is left alone.
    pub fn slab_prep(&self, r: &SliverRef) -> Result<()> {
        let mut guard = r.bmap.lock();
        loop {
            let slot = guard.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
            match slot.state {
                SliverState::New => {
                    slot.state = SliverState::GetSlab;
                    drop(guard);
                    match self.slab_get() {
                        Ok(slab) => {
                            let mut guard = r.bmap.lock();
                            let inner = &mut *guard;
                            let slot = inner.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
                            debug_assert_eq!(slot.state, SliverState::GetSlab);
                            slot.slab = Some(slab);
                            slot.state = SliverState::Empty;
                            self.shared.queues.push_lru_tail(r, slot);
                            drop(guard);
                            r.bmap.notify_all();
                            trace!("slab attached to {:?}", r);
                            return Ok(());
                        }
                        Err(e) => {
                            let mut guard = r.bmap.lock();
                            if let Some(slot) = guard.slot_mut(r.slot) {
                                debug_assert_eq!(slot.state, SliverState::GetSlab);
                                slot.state = SliverState::New;
                            }
                            drop(guard);
                            r.bmap.notify_all();
                            return Err(e);
                        }
                    }
                }
                // Another thread is attaching or the reaper is stripping;
                // both end in a broadcast.
                SliverState::GetSlab | SliverState::SlabFreeing => r.bmap.wait(&mut guard),
                SliverState::Empty
                | SliverState::Faulting
                | SliverState::DataReady
                | SliverState::DataErr => return Ok(()),
                SliverState::Freeing => {
                    debug_assert!(false, "slab_prep on freeing {:?}", r);
                    return Err(not_prepared(r));
                }
            }
        }
    }

    /// Take a slab, evicting if the pool is dry. Blocks until one shows up
    /// or the cache shuts down.
    fn slab_get(&self) -> Result<Arc<Slab>> {
        let shared = &self.shared;
        loop {
            if shared.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Shutdown);
            }
            if let Some(slab) = shared.pool.try_take() {
                return Ok(slab);
            }
            let want = shared.pool.waiters() + 1;
            let freed = reaper::reap(shared, want);
            if freed == 0 {
                debug!("slab pool dry, nothing reapable; parking");
            }
            if let Some(slab) = shared.pool.wait(shared.cfg.slab_wait) {
                return Ok(slab);
            }
        }
    }

    /// Prepare the byte range `[off, off + len)` for `rw` access. Returns
    /// [`PrepOutcome::Ready`] with the operation counted, or an error if
    /// the sliver is poisoned. Blocks while another party holds the fault.
    pub fn io_prep(&self, r: &SliverRef, off: u32, len: u32, rw: Rw) -> Result<PrepOutcome> {
        self.prep_inner(r, off, len, rw, None)
    }

    /// Like [`io_prep`](Self::io_prep), but a fault that cannot complete
    /// inline registers `reply` and returns [`PrepOutcome::WouldBlock`]
    /// instead of blocking. Nothing is counted on a would-block return;
    /// the caller re-prepares once the reply fires.
    pub fn io_prep_async(
        &self,
        r: &SliverRef,
        off: u32,
        len: u32,
        rw: Rw,
        reply: &Arc<AioReply>,
    ) -> Result<PrepOutcome> {
        self.prep_inner(r, off, len, rw, Some(reply))
    }

    fn prep_inner(
        &self,
        r: &SliverRef,
        off: u32,
        len: u32,
        rw: Rw,
        reply: Option<&Arc<AioReply>>,
    ) -> Result<PrepOutcome> {
        self.ensure_open()?;
        let end = off as u64 + u64::from(len);
        if len == 0 || end > SLIVER_SIZE as u64 {
            return Err(Error::OutOfBounds {
                off: u64::from(off),
                len: u64::from(len),
                max: SLIVER_SIZE as u64,
            });
        }
        let mut guard = r.bmap.lock();
        loop {
            let slot = guard.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
            debug_assert!(slot.pins > 0, "io_prep on unpinned {:?}", r);
            match slot.state {
                SliverState::DataErr => return Err(data_error(r)),
                SliverState::DataReady => {
                    count_io(slot, rw);
                    return Ok(PrepOutcome::Ready);
                }
                SliverState::Faulting => {
                    if rw == Rw::Write && slot.repl == Some(ReplRole::Destination) {
                        // Replication payload lands on the staked
                        // destination; the digest comes from the source,
                        // so the write is not marked dirty locally.
                        slot.pending_writes += 1;
                        return Ok(PrepOutcome::Ready);
                    }
                    if let Some(reply) = reply {
                        reply.register();
                        slot.waiting_replies.push(Arc::clone(reply));
                        trace!("attached reply to in-flight fault on {:?}", r);
                        return Ok(PrepOutcome::WouldBlock);
                    }
                    r.bmap.wait(&mut guard);
                }
                SliverState::Empty => break,
                SliverState::GetSlab | SliverState::SlabFreeing => r.bmap.wait(&mut guard),
                SliverState::New | SliverState::Freeing => {
                    // The slab is gone (reaped, or a quarantined
                    // transfer); the caller restarts from slab_prep.
                    return Err(not_prepared(r));
                }
            }
        }
        self.fault_in(r, guard, off, len, rw, reply)
    }

    /// Owner path: the sliver is `Empty` and this thread takes the fault.
    /// Consumes the held guard; the lock is always released around
    /// backing-store transfers.
    fn fault_in(
        &self,
        r: &SliverRef,
        mut guard: parking_lot::MutexGuard<'_, crate::sliver::registry::BmapInner>,
        off: u32,
        len: u32,
        rw: Rw,
        reply: Option<&Arc<AioReply>>,
    ) -> Result<PrepOutcome> {
        let shared = &self.shared;
        let slot = guard.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
        let slab = match &slot.slab {
            Some(slab) => Arc::clone(slab),
            None => {
                debug_assert!(false, "empty sliver without slab {:?}", r);
                return Err(not_prepared(r));
            }
        };
        slot.state = SliverState::Faulting;

        if rw == Rw::Write {
            let off = off as usize;
            let end = off + len as usize;
            if off == 0 && end == SLIVER_SIZE {
                // Cold full overwrite: every block is incoming, nothing to
                // fetch. The state stays Faulting until the write drains.
                slab.inuse().set_all();
                count_io(slot, rw);
                trace!("full-cover write prep on {:?}", r);
                return Ok(PrepOutcome::Ready);
            }
            return self.fault_in_partial_write(r, guard, slab, off, end);
        }

        // Reads fault the whole sliver.
        slab.inuse().set_all();
        let runs = [(0usize, BLOCKS_PER_SLIVER)];

        if shared.cfg.async_faults {
            slot.async_wait = true;
            if let Some(reply) = reply {
                reply.register();
                slot.waiting_replies.push(Arc::clone(reply));
            }
            drop(guard);
            let req = FetchReq {
                r: r.clone(),
                slab,
                runs: runs.to_vec(),
            };
            if let Err(e) = shared.bridge.submit(req) {
                shared.poison(r);
                return Err(e);
            }
            if reply.is_some() {
                return Ok(PrepOutcome::WouldBlock);
            }
            // Plain prep in async mode still completes inline.
            self.wait_ready(r)?;
            let mut guard = r.bmap.lock();
            let slot = guard.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
            count_io(slot, rw);
            return Ok(PrepOutcome::Ready);
        }

        drop(guard);
        if let Err(e) = shared.fetch_blocks(r, &slab, &runs) {
            shared.poison(r);
            return Err(e);
        }
        // Post-fetch verification against the recorded digest; a mismatch
        // poisons the sliver inside do_crc.
        let outcome = crc::do_crc(shared, r)?;
        shared.fault_ready(r);
        trace!("read fault on {:?} settled: {:?}", r, outcome);
        let mut guard = r.bmap.lock();
        let slot = guard.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
        count_io(slot, rw);
        Ok(PrepOutcome::Ready)
    }

    /// Read-modify-write fault: fetch everything the incoming span does
    /// not cover, then flip the bitmap to describe the incoming bytes.
    fn fault_in_partial_write(
        &self,
        r: &SliverRef,
        guard: parking_lot::MutexGuard<'_, crate::sliver::registry::BmapInner>,
        slab: Arc<Slab>,
        off: usize,
        end: usize,
    ) -> Result<PrepOutcome> {
        let shared = &self.shared;

        // Blocks strictly ahead of and behind the span, rounded outward;
        // the unaligned boundary blocks land in both a fetch region and a
        // fixup slot.
        let lead_blks = off.div_ceil(BLOCK_SIZE);
        let tail_blks = (SLIVER_SIZE - end).div_ceil(BLOCK_SIZE);
        let mut fixups = [None::<usize>; 2];
        if off % BLOCK_SIZE != 0 {
            fixups[0] = Some(off / BLOCK_SIZE);
        }
        if end % BLOCK_SIZE != 0 {
            fixups[1] = Some(end / BLOCK_SIZE);
        }

        let bits = slab.inuse();
        for blk in 0..lead_blks {
            bits.set(blk);
        }
        for blk in (BLOCKS_PER_SLIVER - tail_blks)..BLOCKS_PER_SLIVER {
            bits.set(blk);
        }
        // Head and tail regions are queued separately even when they
        // overlap on a tiny span.
        let mut runs = Vec::with_capacity(2);
        if lead_blks > 0 {
            runs.push((0, lead_blks));
        }
        if tail_blks > 0 {
            runs.push((BLOCKS_PER_SLIVER - tail_blks, tail_blks));
        }
        debug!(
            "rmw fault on {:?}: span [{}, {}), fetch regions {:?}, fixups {:?}",
            r, off, end, runs, fixups
        );

        drop(guard);
        if let Err(e) = shared.fetch_blocks(r, &slab, &runs) {
            shared.poison(r);
            return Err(e);
        }

        let mut guard = r.bmap.lock();
        let slot = guard.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
        debug_assert_eq!(slot.state, SliverState::Faulting);
        // Fetched blocks are now valid; flip the map so a set bit means
        // "about to be overwritten", then re-mark the fixup blocks whose
        // fetched content the incoming bytes partially replace.
        slab.inuse().invert();
        for blk in fixups.into_iter().flatten() {
            slab.inuse().set(blk);
        }
        count_io(slot, Rw::Write);
        Ok(PrepOutcome::Ready)
    }

    /// Copy bytes out of a data-ready sliver.
    pub fn read(&self, r: &SliverRef, off: u32, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        let end = off as u64 + buf.len() as u64;
        if end > SLIVER_SIZE as u64 {
            return Err(Error::OutOfBounds {
                off: u64::from(off),
                len: buf.len() as u64,
                max: SLIVER_SIZE as u64,
            });
        }
        let guard = r.bmap.lock();
        let slot = guard.slot(r.slot).ok_or_else(|| not_prepared(r))?;
        let slab = match slot.state {
            SliverState::DataReady => match &slot.slab {
                Some(slab) => Arc::clone(slab),
                None => return Err(not_prepared(r)),
            },
            SliverState::DataErr => return Err(data_error(r)),
            _ => return Err(not_prepared(r)),
        };
        debug_assert!(slot.pending_reads > 0, "read outside a prep window");
        drop(guard);
        slab.copy_out(off as usize, buf);
        Ok(())
    }

    /// Copy bytes into the sliver and write them through to the backing
    /// store. Blocks covering the span are marked in-use for the duration
    /// of the flush and cleared as it lands.
    pub fn write(&self, r: &SliverRef, off: u32, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let end = off as u64 + data.len() as u64;
        if end > SLIVER_SIZE as u64 {
            return Err(Error::OutOfBounds {
                off: u64::from(off),
                len: data.len() as u64,
                max: SLIVER_SIZE as u64,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let guard = r.bmap.lock();
        let slot = guard.slot(r.slot).ok_or_else(|| not_prepared(r))?;
        let slab = match slot.state {
            SliverState::DataReady | SliverState::Faulting => match &slot.slab {
                Some(slab) => Arc::clone(slab),
                None => return Err(not_prepared(r)),
            },
            SliverState::DataErr => return Err(data_error(r)),
            _ => return Err(not_prepared(r)),
        };
        debug_assert!(slot.pending_writes > 0, "write outside a prep window");
        drop(guard);

        slab.copy_in(off as usize, data);
        let first = off as usize / BLOCK_SIZE;
        let last = (off as usize + data.len() - 1) / BLOCK_SIZE;
        for blk in first..=last {
            slab.inuse().set(blk);
        }
        let fileoff = r.fileoff() + u64::from(off);
        let res = slab.with_range(off as usize, data.len(), |bytes| {
            self.shared.store.write_at(r.fid(), fileoff, bytes)
        });
        for blk in first..=last {
            slab.inuse().clear(blk);
        }
        match res {
            Ok(()) => {
                let mut guard = r.bmap.lock();
                let inner = &mut *guard;
                inner.fsize_hint = inner.fsize_hint.max(r.fileoff() + end);
                trace!("wrote [{}, {}) through {:?}", off, end, r);
                Ok(())
            }
            Err(e) => {
                warn!("write-through failed on {:?}: {}", r, e);
                self.shared.poison(r);
                Err(e)
            }
        }
    }

    /// Complete one prepared operation: update the pending counters, run
    /// the state transition the drain implies, and drop the lookup pin.
    pub fn io_done(&self, r: &SliverRef, rw: Rw) {
        match rw {
            Rw::Write => self.shared.wio_done(r),
            Rw::Read => self.shared.rio_done(r),
        }
    }

    /// Block until the sliver leaves `Faulting`. Resolves to `Ok` on
    /// data-ready and the recorded error on a poisoned sliver.
    pub fn wait_ready(&self, r: &SliverRef) -> Result<()> {
        let mut guard = r.bmap.lock();
        loop {
            let slot = guard.slot_mut(r.slot).ok_or_else(|| not_prepared(r))?;
            match slot.state {
                SliverState::DataReady => return Ok(()),
                SliverState::DataErr => return Err(data_error(r)),
                SliverState::Faulting => r.bmap.wait(&mut guard),
                _ => return Err(not_prepared(r)),
            }
        }
    }

    /// Run one digest pass over the sliver: verification while it is
    /// faulting, an on-demand recompute-and-stage when it is dirty.
    pub fn do_crc(&self, r: &SliverRef) -> Result<CrcOutcome> {
        self.ensure_open()?;
        crc::do_crc(&self.shared, r)
    }

    /// Stake the sliver to a replication transfer.
    pub fn repl_prep(&self, r: &SliverRef, role: ReplRole) -> Result<()> {
        self.ensure_open()?;
        repl::repl_prep(r, role)
    }

    /// Settle a replication transfer and drop the stake (and the pin).
    pub fn repl_done(&self, r: &SliverRef, status: ReplStatus) {
        repl::repl_done(&self.shared, r, status)
    }

    /// Transmit ready and aged digest batches to the sink. Returns how
    /// many updates went out; workers call this on their own, embedders
    /// may force a flush.
    pub fn flush_crc_updates(&self) -> Result<usize> {
        self.ensure_open()?;
        self.shared
            .batcher
            .push_updates(self.shared.sink.as_ref(), &self.shared.queues)
    }

    /// Run one eviction pass aiming to free `want` slabs. Returns the
    /// number actually freed.
    pub fn reap(&self, want: usize) -> usize {
        reaper::reap(&self.shared, want)
    }

    /// Seed the digest table for one block-map, typically from the
    /// metadata authority's records. Read faults verify against it.
    pub fn install_crc_table(&self, fid: FileId, bmapno: u32, table: CrcTable) {
        let bmap = self.shared.registry.get_or_create(fid, bmapno);
        bmap.lock().crc_table = Some(table);
        debug!("digest table installed for fid={} bmapno={}", fid, bmapno);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            free_slabs: self.shared.pool.free_count(),
            lru_len: self.shared.queues.lru_len(),
            crcq_len: self.shared.queues.crcq_len(),
            bmaps: self.shared.registry.len(),
            open_batches: self.shared.batcher.open_batches(),
            ready_batches: self.shared.batcher.ready_batches(),
        }
    }

    /// Stop the worker threads and flush whatever digest batches remain.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.bridge.close();
        self.shared.queues.wake_all();
        self.shared.pool.wake_all();
        let handles = mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
        // The public flush is already refusing callers; go straight to the
        // batcher for the final drain.
        match self
            .shared
            .batcher
            .push_updates(self.shared.sink.as_ref(), &self.shared.queues)
        {
            Ok(n) if n > 0 => debug!("flushed {} digest updates at shutdown", n),
            Ok(_) => {}
            Err(e) => warn!("final digest flush failed: {}", e),
        }
        info!("sliver cache stopped");
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for SliverCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Read `runs` of blocks from the backing store into the slab. A short
    /// read is a hole; the slab's zero fill stands in for the missing
    /// bytes.
    pub(crate) fn fetch_blocks(
        &self,
        r: &SliverRef,
        slab: &Arc<Slab>,
        runs: &[(usize, usize)],
    ) -> Result<()> {
        for &(blk, nblks) in runs {
            let off = blk * BLOCK_SIZE;
            let len = nblks * BLOCK_SIZE;
            let fileoff = r.fileoff() + off as u64;
            let n = slab.with_range_mut(off, len, |buf| {
                self.store.read_at(r.fid(), fileoff, buf)
            })?;
            if n < len {
                trace!(
                    "short fetch on {:?} blocks [{}, {}): {} of {} bytes (hole)",
                    r,
                    blk,
                    blk + nblks,
                    n,
                    len
                );
            }
        }
        Ok(())
    }

    /// Poison the sliver after a failed transfer or a digest mismatch.
    /// Wakes waiters and fails any attached reply tokens.
    pub(crate) fn poison(&self, r: &SliverRef) {
        let mut guard = r.bmap.lock();
        let Some(slot) = guard.slot_mut(r.slot) else {
            return;
        };
        slot.state = SliverState::DataErr;
        slot.crc_dirty = false;
        slot.async_wait = false;
        let replies = mem::take(&mut slot.waiting_replies);
        drop(guard);
        r.bmap.notify_all();
        for reply in replies {
            reply.complete(false);
        }
        warn!("sliver {:?} poisoned", r);
    }

    /// Settle a successful fault: transition to data-ready, wake waiters,
    /// fire attached reply tokens.
    pub(crate) fn fault_ready(&self, r: &SliverRef) {
        let mut guard = r.bmap.lock();
        let Some(slot) = guard.slot_mut(r.slot) else {
            return;
        };
        debug_assert_eq!(slot.state, SliverState::Faulting);
        slot.state = SliverState::DataReady;
        slot.async_wait = false;
        let replies = mem::take(&mut slot.waiting_replies);
        drop(guard);
        r.bmap.notify_all();
        for reply in replies {
            reply.complete(true);
        }
    }

    /// Write completion. Runs the Faulting -> DataReady transition for an
    /// owner write, freshens a busy sliver's LRU spot, and on the last
    /// pending write hands the sliver to the CRC queue.
    pub(crate) fn wio_done(&self, r: &SliverRef) {
        let mut guard = r.bmap.lock();
        let inner = &mut *guard;
        let Some(slot) = inner.slot_mut(r.slot) else {
            debug_assert!(false, "wio_done on vanished {:?}", r);
            return;
        };
        debug_assert!(slot.pending_writes > 0, "unbalanced wio_done on {:?}", r);

        if slot.state == SliverState::DataReady
            && slot.pos == QueuePos::Lru
            && slot.pending_writes > 1
        {
            self.queues.requeue_lru(r, slot);
        }

        let mut replies = Vec::new();
        let mut notify = false;
        if slot.state == SliverState::Faulting && slot.repl != Some(ReplRole::Destination) {
            // Owner write drained; the payload is now authoritative. A
            // replication destination settles through repl_done instead.
            slot.state = SliverState::DataReady;
            slot.async_wait = false;
            replies = mem::take(&mut slot.waiting_replies);
            notify = true;
        }

        slot.compl_writes += 1;
        slot.pending_writes -= 1;
        if slot.pending_writes == 0 && slot.pending_reads == 0 {
            // Quiet edge; replication stakes wait for this.
            notify = true;
        }

        if slot.pending_writes == 0
            && slot.crc_dirty
            && !slot.batch_pending
            && !slot.crcing
            && slot.state == SliverState::DataReady
            && slot.pos == QueuePos::Lru
        {
            self.queues.move_to_crcq(r, slot);
            inner.crc_dirty_slivers += 1;
            trace!("{:?} queued for digest", r);
        }

        let Some(slot) = inner.slot_mut(r.slot) else {
            return;
        };
        debug_assert!(slot.pins > 0);
        slot.pins = slot.pins.saturating_sub(1);
        drop(guard);
        if notify {
            r.bmap.notify_all();
        }
        for reply in replies {
            reply.complete(true);
        }
    }

    /// Read completion: drop the pending-read count, freshen the LRU spot
    /// once the sliver goes fully quiet, and unpin.
    pub(crate) fn rio_done(&self, r: &SliverRef) {
        let mut guard = r.bmap.lock();
        let Some(slot) = guard.slot_mut(r.slot) else {
            debug_assert!(false, "rio_done on vanished {:?}", r);
            return;
        };
        debug_assert!(slot.pending_reads > 0, "unbalanced rio_done on {:?}", r);
        slot.pending_reads -= 1;
        let quiet = slot.pending_reads == 0 && slot.pending_writes == 0;
        if quiet && slot.pos == QueuePos::Lru {
            self.queues.requeue_lru(r, slot);
        }
        debug_assert!(slot.pins > 0);
        slot.pins = slot.pins.saturating_sub(1);
        drop(guard);
        if quiet {
            r.bmap.notify_all();
        }
    }
}

fn count_io(slot: &mut SliverSlot, rw: Rw) {
    match rw {
        Rw::Write => {
            slot.pending_writes += 1;
            slot.crc_dirty = true;
        }
        Rw::Read => slot.pending_reads += 1,
    }
}

pub(crate) fn data_error(r: &SliverRef) -> Error {
    Error::DataError {
        fid: r.fid(),
        bmapno: r.bmapno(),
        slot: r.slot,
    }
}

pub(crate) fn not_prepared(r: &SliverRef) -> Error {
    Error::NotPrepared {
        fid: r.fid(),
        bmapno: r.bmapno(),
        slot: r.slot,
    }
}
