//! Sliver lifecycle: the cache engine, per-block-map slot registries,
//! the LRU/CRC queues, the reaper, and replication staking.

pub mod cache;
pub(crate) mod queues;
pub(crate) mod reaper;
pub mod registry;
pub mod repl;
pub mod state;

pub use cache::{CacheStats, PrepOutcome, SliverCache};
pub use registry::{Bmap, BmapRegistry, SliverRef};
pub use repl::ReplStatus;
pub use state::{ReplRole, SliverState};
