//! Per-sliver lifecycle state.
//!
//! A sliver slot moves through a small state machine as buffers come and
//! go:
//!
//! ```text
//! New -> GetSlab -> Empty -> Faulting -> DataReady <-> (reaper) SlabFreeing -> New -> Freeing
//!                                \-> DataErr
//! ```
//!
//! `New` means the slot exists but owns no slab (fresh, or stripped by the
//! reaper). `GetSlab` and `SlabFreeing` are transient windows where one
//! thread is attaching or detaching the slab and others must wait.
//! `Faulting` covers both backing-store read faults and writes that have
//! not yet reached the store. `DataErr` poisons the slot after a failed
//! transfer. `Freeing` marks the slot for removal from the block-map table;
//! a lookup that observes it retries until the slot is gone.
//!
//! Everything in [`SliverSlot`] is guarded by the owning block-map's lock;
//! the fields are plain data on purpose.

use crate::aio::AioReply;
use crate::slab::Slab;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliverState {
    New,
    GetSlab,
    SlabFreeing,
    Empty,
    Faulting,
    DataReady,
    DataErr,
    Freeing,
}

/// Which queue the sliver currently sits on, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePos {
    Off,
    Lru,
    CrcQueue,
}

/// Replication role while a sliver is staked to a replication transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplRole {
    Source,
    Destination,
}

/// State of one sliver within its block-map's slot table.
#[derive(Debug)]
pub struct SliverSlot {
    pub state: SliverState,
    pub pos: QueuePos,
    /// Sequence key of the queue entry; valid only while `pos != Off`.
    pub queue_seq: u64,
    pub slab: Option<Arc<Slab>>,
    /// Lookup references. Nonzero pins keep the reaper away.
    pub pins: u32,
    pub pending_reads: u32,
    pub pending_writes: u32,
    /// Completed-write counter; the CRC worker snapshots it to detect
    /// writes that land while a digest is being computed.
    pub compl_writes: u64,
    /// Payload has changed since the last digest was captured.
    pub crc_dirty: bool,
    /// A worker is computing this sliver's digest right now.
    pub crcing: bool,
    /// A captured digest sits in a batch that has not been acknowledged.
    pub batch_pending: bool,
    /// The fault for this sliver went down the async bridge and has not
    /// completed yet.
    pub async_wait: bool,
    /// Reply tokens attached to the in-flight async fault; drained (and
    /// completed) when the fault settles.
    pub waiting_replies: Vec<Arc<AioReply>>,
    pub repl: Option<ReplRole>,
}

impl SliverSlot {
    pub fn new() -> Self {
        Self {
            state: SliverState::New,
            pos: QueuePos::Off,
            queue_seq: 0,
            slab: None,
            pins: 0,
            pending_reads: 0,
            pending_writes: 0,
            compl_writes: 0,
            crc_dirty: false,
            crcing: false,
            batch_pending: false,
            async_wait: false,
            waiting_replies: Vec::new(),
            repl: None,
        }
    }

    /// The reaper may strip this sliver's slab. A CRC-dirty sliver keeps
    /// its slab: the digest has not been captured yet. Callers additionally
    /// require the sliver to be sitting on the LRU.
    pub fn slab_freeable(&self) -> bool {
        self.pins == 0
            && !self.crcing
            && !self.crc_dirty
            && self.slab.is_some()
            && matches!(
                self.state,
                SliverState::Empty | SliverState::DataReady | SliverState::DataErr
            )
    }

    /// The reaper may drop the slot from the block-map table entirely.
    /// Requires the slab to be gone and no digest work outstanding.
    pub fn fully_freeable(&self) -> bool {
        self.pins == 0
            && self.slab.is_none()
            && self.state == SliverState::New
            && !self.crc_dirty
            && !self.crcing
            && !self.batch_pending
    }
}

impl Default for SliverSlot {
    fn default() -> Self {
        Self::new()
    }
}
