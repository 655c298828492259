//! User-facing buffer handle.
//!
//! A `PooledBuf` owns one allocated block: a run or subpage slot inside a
//! pooled chunk, or an unpooled region for huge requests (and for allocators
//! with pooling disabled). Ownership does the reference counting the wire
//! layer would otherwise need — the block is freed exactly once, in `Drop`,
//! routed through the owning thread's cache when one exists.

use crate::sync::Arc;

use super::allocator::free_with_cache;
use super::arena::{PoolArena, RawAlloc, RawStorage};
use super::chunk::ChunkId;
use super::error::PoolError;
use super::handle::Handle;
use super::region::{Region, RegionProvider};
use super::thread_cache::PoolThreadCache;
use std::ptr::NonNull;

#[derive(Clone, Copy)]
enum BufStorage {
    Pooled { chunk: ChunkId, handle: Handle },
    Unpooled { region: Region },
}

pub struct PooledBuf {
    /// First usable byte.
    ptr: NonNull<u8>,
    /// Byte offset within the owning chunk (0 for unpooled storage).
    offset: usize,
    /// Requested capacity.
    length: usize,
    /// Normalized capacity actually reserved; the buffer may use up to this
    /// many bytes without reallocating.
    max_length: usize,
    /// Upper bound for growth via reallocation.
    max_capacity: usize,
    allocator_id: u64,
    arena: Option<Arc<PoolArena>>,
    provider: &'static dyn RegionProvider,
    storage: BufStorage,
}

// Safety: the allocator guarantees the addressed bytes belong exclusively to
// this buffer until it is dropped.
unsafe impl Send for PooledBuf {}

impl PooledBuf {
    pub(crate) fn from_raw(
        arena: Option<Arc<PoolArena>>,
        allocator_id: u64,
        raw: RawAlloc,
        length: usize,
        max_capacity: usize,
        provider: &'static dyn RegionProvider,
    ) -> Self {
        Self {
            ptr: raw.ptr,
            offset: raw.offset,
            length,
            max_length: raw.max_length,
            max_capacity,
            allocator_id,
            arena,
            provider,
            storage: match raw.storage {
                RawStorage::Pooled { chunk, handle } => BufStorage::Pooled { chunk, handle },
                RawStorage::Unpooled { region } => BufStorage::Unpooled { region },
            },
        }
    }

    /// Requested capacity in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Usable capacity without reallocation (the normalized size).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_length
    }

    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        match &self.arena {
            Some(arena) => arena.is_direct(),
            None => self.provider.kind() == super::region::MemoryKind::Direct,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the block is exclusively owned and valid for `length`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.length) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self gives unique access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.length) }
    }

    #[inline]
    pub(crate) fn allocator_id(&self) -> u64 {
        self.allocator_id
    }

    #[inline]
    pub(crate) fn has_arena(&self) -> bool {
        self.arena.is_some()
    }

    /// Move this buffer onto new storage of `new_capacity` bytes, copying
    /// `min(old, new)` bytes. Read/write cursors are the user layer's
    /// concern; only the bytes move. With `free_old == false` the old block
    /// is intentionally leaked to a caller that took responsibility for it.
    pub(crate) fn reallocate_in_arena(
        &mut self,
        new_capacity: usize,
        free_old: bool,
        mut cache: Option<&mut PoolThreadCache>,
    ) -> Result<(), PoolError> {
        let arena = self
            .arena
            .clone()
            .expect("arena reallocation on unpooled allocator");
        if new_capacity == self.length {
            return Ok(());
        }
        if new_capacity > self.max_capacity {
            return Err(PoolError::CapacityExceeded {
                requested: new_capacity,
                max: self.max_capacity,
            });
        }

        let raw = arena.allocate(cache.as_deref_mut(), new_capacity)?;
        arena.copy(self.ptr, raw.ptr, self.length.min(new_capacity));

        let old_ptr = self.ptr;
        let old_offset = self.offset;
        let old_max_length = self.max_length;
        let old_storage = std::mem::replace(
            &mut self.storage,
            match raw.storage {
                RawStorage::Pooled { chunk, handle } => BufStorage::Pooled { chunk, handle },
                RawStorage::Unpooled { region } => BufStorage::Unpooled { region },
            },
        );
        self.ptr = raw.ptr;
        self.offset = raw.offset;
        self.max_length = raw.max_length;
        self.length = new_capacity;

        if free_old {
            match old_storage {
                BufStorage::Pooled { chunk, handle } => {
                    // Safety: old_ptr was base + old_offset.
                    let base =
                        unsafe { NonNull::new_unchecked(old_ptr.as_ptr().sub(old_offset)) };
                    arena.free_pooled(chunk, base, handle, old_max_length, cache);
                }
                BufStorage::Unpooled { region } => arena.free_unpooled(region),
            }
        }
        Ok(())
    }

    /// Reallocation for buffers of a pooling-disabled allocator: plain
    /// region replacement through the provider.
    pub(crate) fn reallocate_unpooled(
        &mut self,
        new_capacity: usize,
        free_old: bool,
    ) -> Result<(), PoolError> {
        debug_assert!(self.arena.is_none());
        if new_capacity == self.length {
            return Ok(());
        }
        if new_capacity > self.max_capacity {
            return Err(PoolError::CapacityExceeded {
                requested: new_capacity,
                max: self.max_capacity,
            });
        }

        let region = self.provider.allocate(new_capacity.max(1), 0)?;
        // Safety: distinct regions, both valid for the copied span.
        unsafe {
            self.provider
                .copy(self.ptr, region.base(), self.length.min(new_capacity))
        };

        let old_storage = std::mem::replace(&mut self.storage, BufStorage::Unpooled { region });
        self.ptr = region.base();
        self.offset = 0;
        self.max_length = region.size();
        self.length = new_capacity;

        if free_old {
            match old_storage {
                BufStorage::Unpooled { region } => self.provider.release(region),
                BufStorage::Pooled { .. } => unreachable!("unpooled buffer with pooled storage"),
            }
        }
        Ok(())
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        match self.storage {
            BufStorage::Pooled { chunk, handle } => {
                let arena = self.arena.as_ref().expect("pooled buffer without arena");
                // Safety: ptr was base + offset at allocation time.
                let base =
                    unsafe { NonNull::new_unchecked(self.ptr.as_ptr().sub(self.offset)) };
                let max_length = self.max_length;
                free_with_cache(self.allocator_id, |cache| {
                    arena.free_pooled(chunk, base, handle, max_length, cache);
                });
            }
            BufStorage::Unpooled { region } => match &self.arena {
                Some(arena) => arena.free_unpooled(region),
                None => self.provider.release(region),
            },
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.length)
            .field("capacity", &self.max_length)
            .field("max_capacity", &self.max_capacity)
            .field("direct", &self.is_direct())
            .field("pooled", &matches!(self.storage, BufStorage::Pooled { .. }))
            .finish()
    }
}
