//! Sliver digests: computation, the per-region digest table, and the sink
//! that receives batched updates bound for the metadata authority.

mod batch;
pub(crate) mod worker;

pub use batch::{CrcBatch, CrcBatcher};
pub(crate) use worker::do_crc;

use crate::types::{FileId, SLIVERS_PER_BMAP};
use crate::Result;
use crc64fast_nvme::Digest;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Digest over one sliver's full contents.
pub fn sliver_crc(data: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(data);
    digest.sum64()
}

/// How one digest pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcOutcome {
    /// Fetched bytes matched the recorded digest.
    Verified,
    /// Nothing recorded to compare against; the data is accepted as-is.
    Unverified,
    /// Fresh digest captured and staged for transmission.
    Stored(u64),
    /// A write completed mid-computation; the digest was discarded and the
    /// sliver requeued.
    Raced,
}

/// Per-region digest table: one slot per sliver. Seeded from the metadata
/// authority when available, then kept current as local digests are
/// captured.
pub struct CrcTable {
    entries: [Option<u64>; SLIVERS_PER_BMAP as usize],
}

impl CrcTable {
    pub fn new() -> Self {
        Self {
            entries: [None; SLIVERS_PER_BMAP as usize],
        }
    }

    pub fn get(&self, slot: u16) -> Option<u64> {
        self.entries[slot as usize]
    }

    pub fn set(&mut self, slot: u16, crc: u64) {
        self.entries[slot as usize] = Some(crc);
    }

    pub fn clear(&mut self, slot: u16) {
        self.entries[slot as usize] = None;
    }

    pub fn known(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

impl Default for CrcTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport for batched digest updates. One call is one transmission; an
/// error fails the whole transmission and the caller requeues every batch
/// in its original order.
pub trait CrcSink: Send + Sync + 'static {
    fn push(&self, batches: &[CrcBatch]) -> Result<()>;
}

/// One (sliver, digest) record as a sink sees it arrive. Serializable so
/// an embedder's transport can ship it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedUpdate {
    pub fid: FileId,
    pub bmapno: u32,
    pub slot: u16,
    pub crc: u64,
    pub fsize: u64,
}

/// Recording sink used by tests and embedders without a live authority.
#[derive(Default)]
pub struct MemSink {
    updates: Mutex<Vec<PushedUpdate>>,
    transmissions: Mutex<usize>,
    fail: AtomicBool,
}

impl MemSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Every record received so far, in arrival order.
    pub fn updates(&self) -> Vec<PushedUpdate> {
        self.updates.lock().clone()
    }

    /// Number of successful transmissions.
    pub fn transmissions(&self) -> usize {
        *self.transmissions.lock()
    }

    /// Most recently received digest for one sliver.
    pub fn latest_crc(&self, fid: FileId, bmapno: u32, slot: u16) -> Option<u64> {
        self.updates
            .lock()
            .iter()
            .rev()
            .find(|u| u.fid == fid && u.bmapno == bmapno && u.slot == slot)
            .map(|u| u.crc)
    }
}

impl CrcSink for MemSink {
    fn push(&self, batches: &[CrcBatch]) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(crate::Error::SinkUnavailable(
                "injected push failure".into(),
            ));
        }
        let mut updates = self.updates.lock();
        for batch in batches {
            for &(slot, crc) in batch.entries() {
                updates.push(PushedUpdate {
                    fid: batch.fid(),
                    bmapno: batch.bmapno(),
                    slot,
                    crc,
                    fsize: batch.fsize(),
                });
            }
        }
        *self.transmissions.lock() += 1;
        Ok(())
    }
}
