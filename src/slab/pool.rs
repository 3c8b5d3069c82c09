//! Fixed-size slab pool.
//!
//! Every cache buffer is carved out up front; a cache miss takes a slab from
//! the free list and an evicted sliver gives one back. When the list runs
//! dry the taker registers as a waiter and blocks; the reaper sizes its
//! eviction pass by the number of registered waiters.

use super::buffer::Slab;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

struct PoolInner {
    free: Vec<Arc<Slab>>,
    waiters: usize,
}

/// Pool of pre-allocated, recycled slabs.
pub struct SlabPool {
    inner: Mutex<PoolInner>,
    available: Condvar,
    capacity: usize,
}

impl SlabPool {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Arc::new(Slab::new())).collect();
        Self {
            inner: Mutex::new(PoolInner { free, waiters: 0 }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn try_take(&self) -> Option<Arc<Slab>> {
        self.inner.lock().free.pop()
    }

    /// Recycle a slab: wipe it and make it available to the next taker.
    pub fn put(&self, slab: Arc<Slab>) {
        slab.reset();
        let mut inner = self.inner.lock();
        debug_assert!(inner.free.len() < self.capacity);
        inner.free.push(slab);
        drop(inner);
        self.available.notify_one();
    }

    /// Block until a slab shows up or `timeout` passes. The caller counts
    /// as a pool waiter for the duration.
    pub fn wait(&self, timeout: Duration) -> Option<Arc<Slab>> {
        let mut inner = self.inner.lock();
        if let Some(slab) = inner.free.pop() {
            return Some(slab);
        }
        inner.waiters += 1;
        self.available.wait_for(&mut inner, timeout);
        inner.waiters -= 1;
        inner.free.pop()
    }

    /// Number of threads currently blocked in [`wait`](Self::wait).
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Kick every blocked taker, used at shutdown.
    pub fn wake_all(&self) {
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_take_until_empty_then_put() {
        let pool = SlabPool::new(2);
        assert_eq!(pool.free_count(), 2);
        let a = pool.try_take().expect("first slab");
        let b = pool.try_take().expect("second slab");
        assert!(pool.try_take().is_none());
        pool.put(a);
        assert_eq!(pool.free_count(), 1);
        pool.put(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_put_recycles_clean() {
        let pool = SlabPool::new(1);
        let slab = pool.try_take().expect("slab");
        slab.copy_in(0, &[0xab; 16]);
        slab.inuse().set_all();
        pool.put(slab);
        let slab = pool.try_take().expect("slab back");
        let mut buf = [0xffu8; 16];
        slab.copy_out(0, &mut buf);
        assert_eq!(buf, [0u8; 16]);
        assert!(slab.inuse().is_empty());
    }

    #[test]
    fn test_wait_times_out_when_starved() {
        let pool = SlabPool::new(1);
        let _held = pool.try_take().expect("slab");
        assert!(pool.wait(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_wait_sees_concurrent_put() {
        let pool = Arc::new(SlabPool::new(1));
        let held = pool.try_take().expect("slab");
        let giver = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pool.put(held);
            })
        };
        let got = pool.wait(Duration::from_secs(5));
        assert!(got.is_some());
        giver.join().expect("giver thread");
    }
}
