#[cfg(not(target_pointer_width = "64"))]
compile_error!("bytepool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
pub mod pool;

// allocator façade and buffers
pub use pool::allocator::{PooledAllocator, PooledAllocatorConfig};
pub use pool::buffer::PooledBuf;

// errors
pub use pool::error::PoolError;

// metrics
pub use pool::metrics::{
    AllocatorMetrics, ArenaMetrics, ChunkListMetrics, ChunkMetrics, SubpageMetrics,
};
