//! Arena: one shard of the pool.
//!
//! An arena owns its chunks (grouped into the usage-banded chunk lists), one
//! subpage directory per Small size class, and the routing between the three
//! allocation tiers:
//!
//! - **Small** (`sizeIdx <= smallMaxSizeIdx`): thread cache, then the
//!   size class's subpage free list, then a fresh subpage backed by a run.
//! - **Normal** (`sizeIdx < nSizes`): thread cache, then a run carved out of
//!   a pooled chunk (allocating a new chunk as a last resort).
//! - **Huge** (everything else): straight to the region provider, unpooled.
//!
//! Locking: one mutex over all chunk state and the non-atomic counters, plus
//! one mutex per subpage size class (the sentinel lock). Whenever both are
//! held, the sentinel is taken first. Small/huge counters are atomics read
//! without the lock.

use crate::sync::Mutex;
use crate::sync::atomic::{AtomicU32, Ordering};

use super::chunk::{ChunkId, PoolChunk};
use super::chunk_list::{ALLOCATION_ORDER, ChunkLists, ChunkStorage, N_LISTS, Q_INIT};
use super::error::PoolError;
use super::handle::Handle;
use super::metrics::{ArenaMetrics, ChunkListMetrics, ChunkMetrics, SubpageMetrics};
use super::region::{MemoryKind, Region, RegionProvider};
use super::size_class::SizeClasses;
use super::stats::Counter;
use super::subpage::{PoolSubpage, SlotFree, SubpageDirectory, calculate_run_size};
use super::thread_cache::PoolThreadCache;
use std::ptr::NonNull;
use std::sync::PoisonError;

// Arena identity for thread-cache pinning. Plain std atomic on purpose: it
// only mints ids at construction time and is not a synchronization point a
// loom model needs to explore.
static NEXT_ARENA_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Where an allocation's bytes live.
pub(crate) enum RawStorage {
    Pooled { chunk: ChunkId, handle: Handle },
    Unpooled { region: Region },
}

/// A placed allocation before it is wrapped into a user buffer.
pub(crate) struct RawAlloc {
    pub storage: RawStorage,
    /// Address of the first usable byte.
    pub ptr: NonNull<u8>,
    /// Byte offset of the block within its chunk (0 for unpooled).
    pub offset: usize,
    /// Normalized capacity actually reserved.
    pub max_length: usize,
}

pub(crate) struct PoolArena {
    id: u64,
    sc: SizeClasses,
    provider: &'static dyn RegionProvider,

    inner: Mutex<ArenaInner>,
    /// One sentinel lock + directory per Small size class.
    small_subpage_pools: Box<[Mutex<SubpageDirectory>]>,

    allocations_small: Counter,
    allocations_huge: Counter,
    deallocations_huge: Counter,
    active_bytes_huge: Counter,
    /// Arena-mutex acquisitions; lets tests observe cache effectiveness.
    lock_acquisitions: Counter,

    pub(crate) num_thread_caches: AtomicU32,
}

struct ArenaInner {
    chunks: ChunkStorage,
    lists: ChunkLists,
    allocations_normal: u64,
    deallocations_small: u64,
    deallocations_normal: u64,
}

impl PoolArena {
    pub fn new(sc: SizeClasses, provider: &'static dyn RegionProvider) -> Self {
        let small_subpage_pools = (0..sc.n_subpages())
            .map(|_| Mutex::new(SubpageDirectory::new()))
            .collect();
        let lists = ChunkLists::new(sc.chunk_size());
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            sc,
            provider,
            inner: Mutex::new(ArenaInner {
                chunks: ChunkStorage::new(),
                lists,
                allocations_normal: 0,
                deallocations_small: 0,
                deallocations_normal: 0,
            }),
            small_subpage_pools,
            allocations_small: Counter::new(),
            allocations_huge: Counter::new(),
            deallocations_huge: Counter::new(),
            active_bytes_huge: Counter::new(),
            lock_acquisitions: Counter::new(),
            num_thread_caches: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn size_classes(&self) -> &SizeClasses {
        &self.sc
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        self.provider.kind() == MemoryKind::Direct
    }

    fn lock_inner(&self) -> crate::sync::MutexGuard<'_, ArenaInner> {
        self.lock_acquisitions.inc();
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subpage_pool(&self, size_idx: usize) -> crate::sync::MutexGuard<'_, SubpageDirectory> {
        self.small_subpage_pools[size_idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // allocation
    // ------------------------------------------------------------------

    /// Route a request by size tier.
    pub(crate) fn allocate(
        &self,
        cache: Option<&mut PoolThreadCache>,
        req_capacity: usize,
    ) -> Result<RawAlloc, PoolError> {
        let size_idx = self.sc.size2size_idx(req_capacity);
        if size_idx <= self.sc.small_max_size_idx() {
            self.tcache_allocate_small(cache, size_idx)
        } else if size_idx < self.sc.n_sizes() {
            self.tcache_allocate_normal(cache, size_idx)
        } else {
            let norm_capacity = if self.sc.alignment() > 0 {
                self.sc.normalize_size(req_capacity)
            } else {
                req_capacity
            };
            self.allocate_huge(norm_capacity)
        }
    }

    fn tcache_allocate_small(
        &self,
        cache: Option<&mut PoolThreadCache>,
        size_idx: usize,
    ) -> Result<RawAlloc, PoolError> {
        let elem_size = self.sc.size_idx2size(size_idx);

        if let Some(cache) = cache {
            if let Some(entry) = cache.allocate(self, size_idx) {
                // Served from the cache: the block never left the arena's
                // books, so no counter moves.
                return Ok(self.raw_from_subpage_parts(
                    entry.chunk,
                    entry.base,
                    entry.handle,
                    elem_size,
                ));
            }
        }

        // Sentinel lock for this size class. It stays held across the
        // fresh-subpage path below (which takes the arena lock inside), so
        // the only lock order is sentinel before arena.
        let (chunk, handle, base) = {
            let mut dir = self.lock_subpage_pool(size_idx);
            match dir.allocate(self.sc.page_shifts()) {
                Some(hit) => hit,
                None => self.allocate_fresh_subpage(&mut dir, size_idx)?,
            }
        };

        self.allocations_small.inc();
        Ok(self.raw_from_subpage_parts(chunk, base, handle, elem_size))
    }

    /// No free-listed subpage exists: carve a run, install a fresh subpage in
    /// the directory, and take its first slot. Called with the directory
    /// locked.
    fn allocate_fresh_subpage(
        &self,
        dir: &mut SubpageDirectory,
        size_idx: usize,
    ) -> Result<(ChunkId, Handle, NonNull<u8>), PoolError> {
        let run_size = calculate_run_size(&self.sc, size_idx);
        let elem_size = self.sc.size_idx2size(size_idx);

        let (chunk_id, run_handle, base) = {
            let mut inner = self.lock_inner();
            let (chunk_id, run_handle) =
                inner.allocate_run(&self.sc, elem_size, run_size, self.provider)?;
            let chunk = inner.chunks.get_mut(chunk_id);
            debug_assert!(!chunk.has_subpage(run_handle.run_offset()));
            chunk.set_subpage(run_handle.run_offset(), true);
            (chunk_id, run_handle, chunk.base())
        };

        dir.insert(PoolSubpage::new(
            chunk_id,
            base,
            run_handle.run_offset(),
            run_handle.run_size(self.sc.page_shifts()),
            elem_size,
        ));
        // The new subpage is the free-list head; its first slot cannot fail.
        Ok(dir
            .allocate(self.sc.page_shifts())
            .expect("fresh subpage has no free slot"))
    }

    fn tcache_allocate_normal(
        &self,
        cache: Option<&mut PoolThreadCache>,
        size_idx: usize,
    ) -> Result<RawAlloc, PoolError> {
        let norm_capacity = self.sc.size_idx2size(size_idx);

        if let Some(cache) = cache {
            if let Some(entry) = cache.allocate(self, size_idx) {
                return Ok(self.raw_from_run_parts(entry.chunk, entry.base, entry.handle));
            }
        }

        let (chunk_id, handle, base) = {
            let mut inner = self.lock_inner();
            let (chunk_id, handle) =
                inner.allocate_run(&self.sc, norm_capacity, norm_capacity, self.provider)?;
            inner.allocations_normal += 1;
            (chunk_id, handle, inner.chunks.get(chunk_id).base())
        };
        Ok(self.raw_from_run_parts(chunk_id, base, handle))
    }

    fn allocate_huge(&self, norm_capacity: usize) -> Result<RawAlloc, PoolError> {
        let region = self.provider.allocate(norm_capacity, self.sc.alignment())?;
        self.active_bytes_huge.add(region.size());
        self.allocations_huge.inc();
        Ok(RawAlloc {
            ptr: region.base(),
            offset: 0,
            max_length: region.size(),
            storage: RawStorage::Unpooled { region },
        })
    }

    fn raw_from_subpage_parts(
        &self,
        chunk: ChunkId,
        base: NonNull<u8>,
        handle: Handle,
        elem_size: usize,
    ) -> RawAlloc {
        debug_assert!(handle.is_subpage());
        let offset =
            (handle.run_offset() << self.sc.page_shifts()) + handle.bitmap_idx() * elem_size;
        // Safety: the slot lies inside the chunk region.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
        RawAlloc {
            storage: RawStorage::Pooled { chunk, handle },
            ptr,
            offset,
            max_length: elem_size,
        }
    }

    fn raw_from_run_parts(&self, chunk: ChunkId, base: NonNull<u8>, handle: Handle) -> RawAlloc {
        debug_assert!(handle.is_run() && handle.is_used());
        let offset = handle.run_offset() << self.sc.page_shifts();
        // Safety: the run lies inside the chunk region.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
        RawAlloc {
            storage: RawStorage::Pooled { chunk, handle },
            ptr,
            offset,
            max_length: handle.run_size(self.sc.page_shifts()),
        }
    }

    // ------------------------------------------------------------------
    // free
    // ------------------------------------------------------------------

    /// Free a pooled block, preferring the thread cache.
    pub(crate) fn free_pooled(
        &self,
        chunk: ChunkId,
        base: NonNull<u8>,
        handle: Handle,
        norm_capacity: usize,
        cache: Option<&mut PoolThreadCache>,
    ) {
        if let Some(cache) = cache {
            if cache.add(self, chunk, base, handle, norm_capacity) {
                // The arena will not free immediately; the block stays
                // attributed to its chunk until the cache drains it.
                return;
            }
        }
        self.free_chunk(chunk, handle, norm_capacity);
    }

    /// Free a pooled block back into chunk state, bypassing any cache. Also
    /// the drain path for cached entries.
    pub(crate) fn free_chunk(&self, chunk_id: ChunkId, handle: Handle, norm_capacity: usize) {
        assert!(handle.is_used(), "double free: {handle:?}");

        if handle.is_subpage() {
            let size_idx = self.sc.size2size_idx(norm_capacity);
            let outcome = {
                let mut dir = self.lock_subpage_pool(size_idx);
                dir.free(
                    (chunk_id, handle.run_offset() as u32),
                    handle.bitmap_idx(),
                )
            };

            let dead_chunk = {
                let mut inner = self.lock_inner();
                inner.deallocations_small += 1;
                match outcome {
                    SlotFree::Alive => None,
                    SlotFree::Dead => {
                        // The subpage retired: release its run.
                        inner
                            .chunks
                            .get_mut(chunk_id)
                            .set_subpage(handle.run_offset(), false);
                        inner.free_run_and_migrate(&self.sc, chunk_id, handle)
                    }
                }
            };
            if let Some(chunk) = dead_chunk {
                self.destroy_chunk(chunk);
            }
            return;
        }

        let dead_chunk = {
            let mut inner = self.lock_inner();
            inner.deallocations_normal += 1;
            inner.free_run_and_migrate(&self.sc, chunk_id, handle)
        };
        if let Some(chunk) = dead_chunk {
            self.destroy_chunk(chunk);
        }
    }

    /// Free an unpooled (huge) region.
    pub(crate) fn free_unpooled(&self, region: Region) {
        self.active_bytes_huge.sub(region.size());
        self.deallocations_huge.inc();
        self.provider.release(region);
    }

    /// Destruction happens outside the critical section.
    fn destroy_chunk(&self, chunk: Box<PoolChunk>) {
        debug_assert_eq!(chunk.free_bytes, chunk.chunk_size());
        self.provider.release(chunk.region());
    }

    /// Variant-specific copy primitive, for reallocation.
    pub(crate) fn copy(&self, src: NonNull<u8>, dst: NonNull<u8>, len: usize) {
        // Safety: both blocks are live allocations of at least `len` bytes
        // from this arena's provider, and distinct blocks never overlap.
        unsafe { self.provider.copy(src, dst, len) };
    }

    // ------------------------------------------------------------------
    // metrics
    // ------------------------------------------------------------------

    pub(crate) fn metrics(&self) -> ArenaMetrics {
        // Directory locks strictly before the arena lock.
        let mut subpages = Vec::new();
        for pool in self.small_subpage_pools.iter() {
            let dir = pool.lock().unwrap_or_else(PoisonError::into_inner);
            for (elem_size, max_num_elems, num_avail, in_free_list) in dir.snapshot() {
                subpages.push(SubpageMetrics {
                    elem_size,
                    max_num_elems,
                    num_avail,
                    in_free_list,
                });
            }
        }

        let inner = self.lock_inner();
        let chunk_lists = (0..N_LISTS)
            .map(|li| ChunkListMetrics {
                min_usage: inner.lists.min_usage(li),
                max_usage: inner.lists.max_usage(li),
                chunks: inner
                    .lists
                    .members(&inner.chunks, li)
                    .into_iter()
                    .map(|id| {
                        let chunk = inner.chunks.get(id);
                        ChunkMetrics {
                            usage: chunk.usage(),
                            free_bytes: chunk.free_bytes,
                            chunk_size: chunk.chunk_size(),
                        }
                    })
                    .collect(),
            })
            .collect();
        let pooled_bytes: usize = inner.chunks.iter().map(|(_, c)| c.chunk_size()).sum();

        ArenaMetrics {
            is_direct: self.is_direct(),
            num_thread_caches: self.num_thread_caches.load(Ordering::Relaxed) as usize,
            allocations_small: self.allocations_small.get(),
            allocations_normal: inner.allocations_normal,
            allocations_huge: self.allocations_huge.get(),
            deallocations_small: inner.deallocations_small,
            deallocations_normal: inner.deallocations_normal,
            deallocations_huge: self.deallocations_huge.get(),
            active_bytes_huge: self.active_bytes_huge.get(),
            active_bytes: self.active_bytes_huge.get() + pooled_bytes,
            num_chunks: inner.chunks.live_count(),
            chunk_lists,
            subpages,
        }
    }

    // ------------------------------------------------------------------
    // test hooks
    // ------------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn lock_acquisitions(&self) -> usize {
        self.lock_acquisitions.get()
    }

    /// Free runs of every live chunk, keyed by chunk id.
    #[cfg(test)]
    pub(crate) fn chunk_free_runs(&self) -> Vec<(ChunkId, Vec<(usize, usize)>)> {
        let inner = self.lock_inner();
        inner
            .chunks
            .iter()
            .map(|(id, c)| (id, c.free_runs()))
            .collect()
    }

    /// Assert the at-rest invariants of every index structure.
    #[cfg(test)]
    pub(crate) fn check_integrity(&self) {
        for pool in self.small_subpage_pools.iter() {
            pool.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .check_integrity();
        }
        let inner = self.lock_inner();
        for (_, chunk) in inner.chunks.iter() {
            chunk.check_integrity(&self.sc);
        }
    }
}

impl Drop for PoolArena {
    fn drop(&mut self) {
        // Explicit teardown: every chunk region goes back to the provider.
        // Thread caches hold the arena alive through their Arc, so no cached
        // entry can outlive this point.
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<ChunkId> = inner.chunks.iter().map(|(id, _)| id).collect();
        for id in ids {
            let chunk = inner.chunks.remove(id);
            self.provider.release(chunk.region());
        }
    }
}

impl ArenaInner {
    /// Carve a run out of the pooled chunks, trying lists mid-usage first and
    /// creating a fresh chunk when none can serve it.
    fn allocate_run(
        &mut self,
        sc: &SizeClasses,
        norm_capacity: usize,
        run_size: usize,
        provider: &'static dyn RegionProvider,
    ) -> Result<(ChunkId, Handle), PoolError> {
        for li in ALLOCATION_ORDER {
            if let Some(found) =
                self.lists
                    .allocate(&mut self.chunks, li, norm_capacity, run_size, sc)
            {
                return Ok(found);
            }
        }

        // Nothing fits: create a chunk. On provider failure no arena state
        // has been touched.
        let region = provider.allocate(sc.chunk_size(), sc.alignment())?;
        let mut chunk = Box::new(PoolChunk::new(region, sc));
        let handle = chunk.allocate_run(run_size, sc);
        debug_assert!(!handle.is_none(), "fresh chunk cannot satisfy run");
        let id = self.chunks.insert(chunk);
        self.lists.add(&mut self.chunks, Q_INIT, id);
        Ok((id, handle))
    }

    /// Release a run and migrate its chunk; returns the chunk when it fell
    /// off the chain and must be destroyed by the caller (outside the lock).
    fn free_run_and_migrate(
        &mut self,
        sc: &SizeClasses,
        chunk_id: ChunkId,
        handle: Handle,
    ) -> Option<Box<PoolChunk>> {
        let list = {
            let chunk = self.chunks.get_mut(chunk_id);
            chunk.free_run(handle, sc);
            chunk.list as usize
        };
        debug_assert!(list < N_LISTS, "freeing into an unlinked chunk");

        if self.lists.free_migrate(&mut self.chunks, list, chunk_id) {
            None
        } else {
            Some(self.chunks.remove(chunk_id))
        }
    }
}
