// SliverCache - sliver caching and CRC pipeline for file I/O servers
// Caches 1 MiB slivers of 128 MiB block-maps over a backing store

#![warn(rust_2018_idioms)]

pub mod aio;
pub mod config;
pub mod crc;
pub mod slab;
pub mod sliver;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use aio::AioReply;
pub use config::CacheConfig;
pub use crc::{CrcOutcome, CrcSink};
pub use error::{Error, Result};
pub use sliver::{CacheStats, PrepOutcome, ReplRole, ReplStatus, SliverCache, SliverRef};
pub use store::BackingStore;
pub use types::{FileId, Rw};

/// Sliver cache error types
pub mod error {
    use crate::types::FileId;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error(
            "digest mismatch on sliver {slot} of {fid}/{bmapno}: \
             stored {stored:#018x}, computed {computed:#018x}"
        )]
        CrcMismatch {
            fid: FileId,
            bmapno: u32,
            slot: u16,
            stored: u64,
            computed: u64,
        },

        #[error("data error on sliver {slot} of {fid}/{bmapno}")]
        DataError { fid: FileId, bmapno: u32, slot: u16 },

        #[error("sliver {slot} of {fid}/{bmapno} is not prepared")]
        NotPrepared { fid: FileId, bmapno: u32, slot: u16 },

        #[error("span [{off}, {off}+{len}) exceeds sliver size {max}")]
        OutOfBounds { off: u64, len: u64, max: u64 },

        #[error("replication already staked on sliver {slot} of {fid}/{bmapno}")]
        ReplBusy { fid: FileId, bmapno: u32, slot: u16 },

        #[error("digest sink unavailable: {0}")]
        SinkUnavailable(String),

        #[error("cache is shutting down")]
        Shutdown,
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_the_sliver() {
        let err = Error::NotPrepared {
            fid: FileId(7),
            bmapno: 3,
            slot: 12,
        };
        assert_eq!(err.to_string(), "sliver 12 of 0x0000000000000007/3 is not prepared");
    }
}
