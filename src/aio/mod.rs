//! Asynchronous fault plumbing: completion tokens, the fetch submission
//! bridge, and the fetch/collector thread pool.
//!
//! With async faults on, a prep that misses queues its block runs here
//! and returns instead of blocking the server thread. Fetch workers pull
//! requests off a shared channel and run the backing-store reads; a
//! single collector settles each sliver afterwards, verifying the fetched
//! payload against its recorded digest before making it visible. Reply
//! tokens let one server thread scatter preps across many slivers and
//! sleep once for all of them.

use crate::crc;
use crate::slab::Slab;
use crate::sliver::cache::Shared;
use crate::sliver::registry::SliverRef;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct ReplyState {
    outstanding: usize,
    sealed: bool,
    failed: bool,
}

/// Completion token for asynchronous preps.
///
/// Every prep that goes down the bridge registers one completion on the
/// caller's token. The caller arms the token when it has attached its
/// last prep; [`AioReply::wait`] then blocks until each registered fault
/// has settled, one way or the other. Tokens are one-shot.
#[derive(Debug, Default)]
pub struct AioReply {
    state: Mutex<ReplyState>,
    done: Condvar,
}

impl AioReply {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one pending completion. The prep attaching this token calls
    /// it under the block-map lock.
    pub(crate) fn register(&self) {
        self.state.lock().outstanding += 1;
    }

    /// Settle one registered completion.
    pub(crate) fn complete(&self, ok: bool) {
        let mut st = self.state.lock();
        debug_assert!(st.outstanding > 0, "unbalanced reply completion");
        st.outstanding = st.outstanding.saturating_sub(1);
        if !ok {
            st.failed = true;
        }
        if st.outstanding == 0 {
            drop(st);
            self.done.notify_all();
        }
    }

    /// Seal the token: no further preps will register on it.
    pub fn arm(&self) {
        let mut st = self.state.lock();
        st.sealed = true;
        if st.outstanding == 0 {
            drop(st);
            self.done.notify_all();
        }
    }

    /// Block until the token is armed and every registered fault has
    /// settled. Returns `true` when all of them came back clean; the
    /// caller re-prepares to pick up each sliver's individual verdict.
    pub fn wait(&self) -> bool {
        let mut st = self.state.lock();
        while !st.sealed || st.outstanding > 0 {
            self.done.wait(&mut st);
        }
        !st.failed
    }

    /// Non-blocking check; `None` while completions are still in flight
    /// or the token is not yet armed.
    pub fn is_ready(&self) -> Option<bool> {
        let st = self.state.lock();
        if st.sealed && st.outstanding == 0 {
            Some(!st.failed)
        } else {
            None
        }
    }
}

/// One queued fetch: the runs of missing blocks for a faulting sliver.
pub(crate) struct FetchReq {
    pub(crate) r: SliverRef,
    pub(crate) slab: Arc<Slab>,
    pub(crate) runs: Vec<(usize, usize)>,
}

/// Submission side of the fetch pool. Stays unplumbed when the cache
/// runs synchronous faults; submitting then reports shutdown.
pub(crate) struct AioBridge {
    tx: Mutex<Option<mpsc::Sender<FetchReq>>>,
}

impl AioBridge {
    pub(crate) fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    fn install(&self, tx: mpsc::Sender<FetchReq>) {
        *self.tx.lock() = Some(tx);
    }

    pub(crate) fn submit(&self, req: FetchReq) -> Result<()> {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(req).map_err(|_| Error::Shutdown),
            None => Err(Error::Shutdown),
        }
    }

    /// Drop the sender. Fetch workers finish what they hold and exit;
    /// the collector follows once their result senders go away.
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }
}

/// Start the fetch workers and the collector, plumbing the bridge into
/// `shared`. The returned handles join at cache shutdown.
pub(crate) fn spawn(shared: &Arc<Shared>) -> Result<Vec<JoinHandle<()>>> {
    let (req_tx, req_rx) = mpsc::channel::<FetchReq>();
    let (res_tx, res_rx) = mpsc::channel::<(SliverRef, Result<()>)>();
    shared.bridge.install(req_tx);

    let req_rx = Arc::new(Mutex::new(req_rx));
    let mut handles = Vec::with_capacity(shared.cfg.fetch_workers + 1);
    for i in 0..shared.cfg.fetch_workers {
        let worker_shared = Arc::clone(shared);
        let rx = Arc::clone(&req_rx);
        let tx = res_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("sliver-fetch-{}", i))
            .spawn(move || fetch_loop(&worker_shared, &rx, &tx))?;
        handles.push(handle);
    }
    drop(res_tx);

    let collector_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name("fetch-collector".to_string())
        .spawn(move || collect_loop(&collector_shared, res_rx))?;
    handles.push(handle);
    Ok(handles)
}

fn fetch_loop(
    shared: &Shared,
    rx: &Mutex<mpsc::Receiver<FetchReq>>,
    res: &mpsc::Sender<(SliverRef, Result<()>)>,
) {
    loop {
        // Holding the lock across recv serializes the take, not the
        // fetch itself.
        let req = match rx.lock().recv() {
            Ok(req) => req,
            Err(_) => break,
        };
        let outcome = shared.fetch_blocks(&req.r, &req.slab, &req.runs);
        if res.send((req.r, outcome)).is_err() {
            break;
        }
    }
    trace!("fetch worker exiting");
}

fn collect_loop(shared: &Arc<Shared>, rx: mpsc::Receiver<(SliverRef, Result<()>)>) {
    while let Ok((r, outcome)) = rx.recv() {
        match outcome {
            Ok(()) => match crc::do_crc(shared, &r) {
                Ok(_) => shared.fault_ready(&r),
                // A mismatch has already poisoned the sliver.
                Err(e) => debug!("fault verification failed on {:?}: {}", r, e),
            },
            Err(e) => {
                warn!("async fetch failed on {:?}: {}", r, e);
                shared.poison(&r);
            }
        }
    }
    trace!("fetch collector exiting");
}
