//! Slab memory: pooled sliver-sized buffers and their block bitmaps.

mod bitmap;
mod buffer;
mod pool;

pub use bitmap::BlockBitmap;
pub use buffer::Slab;
pub use pool::SlabPool;
