//! Per-thread caches of recently freed blocks.
//!
//! A cache is owned by exactly one thread and pinned to one heap and one
//! direct arena for its whole life. Each cacheable size class gets a bounded
//! queue of freed blocks; frees offer into the back, allocations pop from the
//! front (least recently enqueued first), so every path is plain single-owner
//! code with no locking.
//!
//! Decay: every `trim_interval` allocation attempts the cache trims itself —
//! any queue whose hit count since the last trim stayed under half its
//! capacity frees its oldest half back to the arena. This drains queues for
//! sizes the thread stopped using without touching hot ones.

use crate::sync::Arc;
use crate::sync::atomic::Ordering;

use super::arena::PoolArena;
use super::chunk::ChunkId;
use super::handle::Handle;
use std::collections::VecDeque;
use std::ptr::NonNull;

/// A freed block parked in a thread cache. Still accounted as allocated by
/// its chunk; the cache never owns bytes, only the right to hand them back
/// out.
pub(crate) struct CacheEntry {
    pub chunk: ChunkId,
    /// Owning chunk's base address, kept so a cache hit resolves the block
    /// address without the arena lock.
    pub base: NonNull<u8>,
    pub handle: Handle,
}

// Safety: entries reference chunks owned by the pinned arena; the cache moves
// with its thread.
unsafe impl Send for CacheEntry {}

struct RegionCache {
    queue: VecDeque<CacheEntry>,
    capacity: usize,
    /// Normalized size of every block in this queue.
    size: usize,
    /// Successful pops since the last trim.
    hits: u32,
}

impl RegionCache {
    fn new(capacity: usize, size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            size,
            hits: 0,
        }
    }

    fn pop(&mut self) -> Option<CacheEntry> {
        let entry = self.queue.pop_front();
        if entry.is_some() {
            self.hits += 1;
        }
        entry
    }

    fn offer(&mut self, entry: CacheEntry) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(entry);
        true
    }

    /// Idle queues (fewer hits than half the capacity since the last trim)
    /// give their oldest half back to the arena.
    fn trim(&mut self, arena: &PoolArena) {
        if (self.hits as usize) < self.capacity / 2 {
            let drain = self.queue.len() / 2;
            for _ in 0..drain {
                let entry = self.queue.pop_front().expect("drained past queue length");
                arena.free_chunk(entry.chunk, entry.handle, self.size);
            }
        }
        self.hits = 0;
    }

    fn free_all(&mut self, arena: &PoolArena) {
        while let Some(entry) = self.queue.pop_front() {
            arena.free_chunk(entry.chunk, entry.handle, self.size);
        }
        self.hits = 0;
    }
}

/// Queues for one pinned arena: one per Small class, one per cacheable
/// Normal class (sizes up to `max_cached_buffer_capacity`).
struct ArenaCaches {
    arena: Arc<PoolArena>,
    small_max_size_idx: usize,
    small: Box<[RegionCache]>,
    normal: Box<[RegionCache]>,
}

impl ArenaCaches {
    fn new(
        arena: Arc<PoolArena>,
        small_cache_size: usize,
        normal_cache_size: usize,
        max_cached_buffer_capacity: usize,
    ) -> Self {
        let sc = arena.size_classes();
        let small_max_size_idx = sc.small_max_size_idx();
        let small: Box<[RegionCache]> = (0..sc.n_subpages())
            .map(|si| RegionCache::new(small_cache_size, sc.size_idx2size(si)))
            .collect();

        let max_cached = max_cached_buffer_capacity.min(sc.chunk_size());
        let mut normal = Vec::new();
        let mut si = small_max_size_idx + 1;
        while si < sc.n_sizes() && sc.size_idx2size(si) <= max_cached {
            normal.push(RegionCache::new(normal_cache_size, sc.size_idx2size(si)));
            si += 1;
        }

        arena.num_thread_caches.fetch_add(1, Ordering::Relaxed);
        Self {
            small_max_size_idx,
            small,
            normal: normal.into_boxed_slice(),
            arena,
        }
    }

    fn cache_for(&mut self, size_idx: usize) -> Option<&mut RegionCache> {
        if size_idx <= self.small_max_size_idx {
            self.small.get_mut(size_idx)
        } else {
            self.normal.get_mut(size_idx - self.small_max_size_idx - 1)
        }
    }

    fn trim(&mut self) {
        for cache in self.small.iter_mut().chain(self.normal.iter_mut()) {
            cache.trim(&self.arena);
        }
    }

    fn free_all(&mut self) {
        for cache in self.small.iter_mut().chain(self.normal.iter_mut()) {
            cache.free_all(&self.arena);
        }
    }
}

pub(crate) struct PoolThreadCache {
    heap: Option<ArenaCaches>,
    direct: Option<ArenaCaches>,
    /// Allocation attempts since the last automatic trim.
    allocations: u32,
    trim_interval: u32,
}

impl PoolThreadCache {
    pub fn new(
        heap_arena: Option<Arc<PoolArena>>,
        direct_arena: Option<Arc<PoolArena>>,
        small_cache_size: usize,
        normal_cache_size: usize,
        max_cached_buffer_capacity: usize,
        trim_interval: u32,
    ) -> Self {
        Self {
            heap: heap_arena.map(|a| {
                ArenaCaches::new(
                    a,
                    small_cache_size,
                    normal_cache_size,
                    max_cached_buffer_capacity,
                )
            }),
            direct: direct_arena.map(|a| {
                ArenaCaches::new(
                    a,
                    small_cache_size,
                    normal_cache_size,
                    max_cached_buffer_capacity,
                )
            }),
            allocations: 0,
            trim_interval,
        }
    }

    /// The arena this cache is pinned to for the given kind, if any.
    pub fn arena_for(&self, direct: bool) -> Option<&Arc<PoolArena>> {
        let caches = if direct {
            self.direct.as_ref()
        } else {
            self.heap.as_ref()
        };
        caches.map(|c| &c.arena)
    }

    fn caches_for(&mut self, arena: &PoolArena) -> Option<&mut ArenaCaches> {
        [self.heap.as_mut(), self.direct.as_mut()]
            .into_iter()
            .flatten()
            .find(|c| c.arena.id() == arena.id())
    }

    /// Pop a cached block of exactly this size class. Returns `None` without
    /// side effects on miss.
    pub fn allocate(&mut self, arena: &PoolArena, size_idx: usize) -> Option<CacheEntry> {
        let entry = self
            .caches_for(arena)
            .and_then(|caches| caches.cache_for(size_idx))
            .and_then(RegionCache::pop);

        self.allocations += 1;
        if self.trim_interval > 0 && self.allocations >= self.trim_interval {
            self.allocations = 0;
            self.trim();
        }
        entry
    }

    /// Park a freed block. Returns false (caller frees to the arena) when the
    /// block belongs to an arena this thread is not pinned to, the size class
    /// is not cacheable, or the queue is full.
    pub fn add(
        &mut self,
        arena: &PoolArena,
        chunk: ChunkId,
        base: NonNull<u8>,
        handle: Handle,
        norm_capacity: usize,
    ) -> bool {
        let size_idx = arena.size_classes().size2size_idx(norm_capacity);
        let Some(cache) = self
            .caches_for(arena)
            .and_then(|caches| caches.cache_for(size_idx))
        else {
            return false;
        };
        debug_assert_eq!(cache.size, norm_capacity);
        cache.offer(CacheEntry {
            chunk,
            base,
            handle,
        })
    }

    /// Decay pass over every queue; see the module docs.
    pub fn trim(&mut self) {
        for caches in [self.heap.as_mut(), self.direct.as_mut()]
            .into_iter()
            .flatten()
        {
            caches.trim();
        }
    }

    /// Return every cached block to its owning arena.
    pub fn free_all(&mut self) {
        for caches in [self.heap.as_mut(), self.direct.as_mut()]
            .into_iter()
            .flatten()
        {
            caches.free_all();
        }
    }
}

impl Drop for PoolThreadCache {
    fn drop(&mut self) {
        self.free_all();
        for caches in [self.heap.as_ref(), self.direct.as_ref()]
            .into_iter()
            .flatten()
        {
            caches.arena.num_thread_caches.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
