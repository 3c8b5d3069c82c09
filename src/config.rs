//! Cache tuning knobs.

use crate::types::BATCH_MAX_AGE;
use std::time::Duration;

/// Sliver cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of sliver-sized slabs in the pool. Bounds resident cache
    /// memory at roughly `slab_count` MiB.
    pub slab_count: usize,
    /// Background digest worker threads.
    pub crc_workers: usize,
    /// Fetch threads behind the async bridge. Only consulted when
    /// `async_faults` is on.
    pub fetch_workers: usize,
    /// Route read faults through the fetch pool instead of blocking the
    /// preparing thread.
    pub async_faults: bool,
    /// Staleness bound on an open digest batch before an age-based flush.
    pub batch_max_age: Duration,
    /// How long a digest worker parks on an empty queue per cycle.
    pub crcq_wait: Duration,
    /// How long a slab request parks per eviction attempt.
    pub slab_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slab_count: 256,
            crc_workers: 2,
            fetch_workers: 4,
            async_faults: false,
            batch_max_age: BATCH_MAX_AGE,
            crcq_wait: Duration::from_secs(2),
            slab_wait: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let cfg = CacheConfig::default();
        assert!(cfg.slab_count > 0);
        assert!(cfg.crc_workers > 0);
        assert!(!cfg.async_faults);
        assert_eq!(cfg.batch_max_age, Duration::from_secs(2));
    }
}
