//! Allocator façade.
//!
//! Owns a fixed array of heap arenas and one of direct arenas. A thread's
//! first allocation picks the least-loaded arena of each kind (fewest pinned
//! thread caches) and binds a cache to them for the thread's life; the cache
//! registry is thread-local and keyed by allocator id, so tests can run any
//! number of isolated allocators side by side — there is no process-global
//! instance.

use crate::sync::Arc;
use crate::sync::atomic::Ordering;

use super::arena::PoolArena;
use super::buffer::PooledBuf;
use super::error::PoolError;
use super::metrics::AllocatorMetrics;
use super::region::{DIRECT_PROVIDER, HEAP_PROVIDER, RegionProvider};
use super::size_class::SizeClasses;
use super::thread_cache::PoolThreadCache;
use std::cell::RefCell;

const MIN_PAGE_SIZE: usize = 4096;
/// Chunks stay below 1 GiB so page counts and offsets fit the handle fields.
const MAX_CHUNK_SIZE: usize = 1 << 30;
/// Buffer growth doubles below this threshold and steps linearly above it.
const CALCULATE_THRESHOLD: usize = 4 * 1024 * 1024;

// Allocator identity for the thread-cache registry. Plain std atomic: mints
// ids at construction only, never a synchronization point loom must explore.
static NEXT_ALLOCATOR_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Tunables recognized by the allocator. All fields have usable defaults.
#[derive(Clone, Debug)]
pub struct PooledAllocatorConfig {
    /// Number of heap arenas; 0 disables heap pooling. Default `2 * cpus`.
    pub num_heap_arenas: usize,
    /// Number of direct arenas; 0 disables direct pooling. Default `2 * cpus`.
    pub num_direct_arenas: usize,
    /// Page size; power of two, at least 4 KiB. Default 8 KiB.
    pub page_size: usize,
    /// Chunk size exponent: `chunk_size = page_size << max_order`.
    /// Range 0..=14, default 11 (16 MiB chunks at the default page size).
    pub max_order: u32,
    /// Thread-cache queue depth per Small size class. Default 256.
    pub small_cache_size: usize,
    /// Thread-cache queue depth per cacheable Normal size class. Default 64.
    pub normal_cache_size: usize,
    /// Largest Normal size held in thread caches. Default 32 KiB.
    pub max_cached_buffer_capacity: usize,
    /// When false, no thread receives a cache and every allocation takes the
    /// arena path. Default true.
    pub use_cache_for_all_threads: bool,
    /// Address alignment for direct regions: 0 or a power of two not larger
    /// than the page size. Default 0.
    pub direct_memory_cache_alignment: usize,
    /// Cache decay: trim after this many allocation attempts. 0 disables the
    /// automatic trigger (an external timer can still call
    /// [`PooledAllocator::trim_current_thread_cache`]). Default 8192.
    pub cache_trim_interval: u32,
    /// Period, in milliseconds, for an executor-driven decay timer. The
    /// allocator owns no threads; an executor that wants time-based decay
    /// schedules [`PooledAllocator::trim_current_thread_cache`] at this
    /// interval. 0 (the default) means allocation-count decay only.
    pub cache_trim_interval_millis: u64,
}

impl Default for PooledAllocatorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            num_heap_arenas: 2 * cpus,
            num_direct_arenas: 2 * cpus,
            page_size: 8192,
            max_order: 11,
            small_cache_size: 256,
            normal_cache_size: 64,
            max_cached_buffer_capacity: 32 * 1024,
            use_cache_for_all_threads: true,
            direct_memory_cache_alignment: 0,
            cache_trim_interval: 8192,
            cache_trim_interval_millis: 0,
        }
    }
}

impl PooledAllocatorConfig {
    /// Returns `(page_shifts, chunk_size)` or the reason the combination is
    /// rejected.
    fn validate(&self) -> Result<(u32, usize), PoolError> {
        let page_size = self.page_size;
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(PoolError::ConfigInvalid(format!(
                "pageSize: {page_size} (expected: power of two, at least {MIN_PAGE_SIZE})"
            )));
        }

        let alignment = self.direct_memory_cache_alignment;
        if alignment > 0 && (!alignment.is_power_of_two() || alignment > page_size) {
            return Err(PoolError::ConfigInvalid(format!(
                "directMemoryCacheAlignment: {alignment} (expected: power of two, at most pageSize {page_size})"
            )));
        }

        if self.max_order > 14 {
            return Err(PoolError::ConfigInvalid(format!(
                "maxOrder: {} (expected: 0-14)",
                self.max_order
            )));
        }

        let mut chunk_size = page_size;
        for _ in 0..self.max_order {
            if chunk_size > MAX_CHUNK_SIZE / 2 {
                return Err(PoolError::ConfigInvalid(format!(
                    "pageSize ({page_size}) << maxOrder ({}) must not exceed {MAX_CHUNK_SIZE}",
                    self.max_order
                )));
            }
            chunk_size <<= 1;
        }

        Ok((page_size.trailing_zeros(), chunk_size))
    }
}

pub struct PooledAllocator {
    id: u64,
    config: PooledAllocatorConfig,
    heap_arenas: Vec<Arc<PoolArena>>,
    direct_arenas: Vec<Arc<PoolArena>>,
}

impl PooledAllocator {
    pub fn new() -> Result<Self, PoolError> {
        Self::with_config(PooledAllocatorConfig::default())
    }

    pub fn with_config(config: PooledAllocatorConfig) -> Result<Self, PoolError> {
        let (page_shifts, chunk_size) = config.validate()?;
        let page_size = config.page_size;

        let heap_arenas: Vec<Arc<PoolArena>> = (0..config.num_heap_arenas)
            .map(|_| {
                Arc::new(PoolArena::new(
                    SizeClasses::new(page_size, page_shifts, chunk_size, 0),
                    &HEAP_PROVIDER,
                ))
            })
            .collect();
        let direct_arenas: Vec<Arc<PoolArena>> = (0..config.num_direct_arenas)
            .map(|_| {
                Arc::new(PoolArena::new(
                    SizeClasses::new(
                        page_size,
                        page_shifts,
                        chunk_size,
                        config.direct_memory_cache_alignment,
                    ),
                    &DIRECT_PROVIDER,
                ))
            })
            .collect();

        log::debug!(
            "pooled allocator: {} heap arena(s), {} direct arena(s), pageSize {page_size}, chunkSize {chunk_size}",
            heap_arenas.len(),
            direct_arenas.len(),
        );

        Ok(Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            config,
            heap_arenas,
            direct_arenas,
        })
    }

    pub fn config(&self) -> &PooledAllocatorConfig {
        &self.config
    }

    /// Allocate a buffer of `req_capacity` bytes, growable up to
    /// `max_capacity`.
    pub fn allocate(
        &self,
        req_capacity: usize,
        max_capacity: usize,
        prefer_direct: bool,
    ) -> Result<PooledBuf, PoolError> {
        if req_capacity > max_capacity {
            return Err(PoolError::SizeOutOfRange {
                requested: req_capacity,
                max: max_capacity,
            });
        }

        let arenas = if prefer_direct {
            &self.direct_arenas
        } else {
            &self.heap_arenas
        };
        let provider: &'static dyn RegionProvider = if prefer_direct {
            &DIRECT_PROVIDER
        } else {
            &HEAP_PROVIDER
        };

        if arenas.is_empty() {
            // Pooling disabled for this kind: plain region allocation.
            let alignment = if prefer_direct {
                self.config.direct_memory_cache_alignment
            } else {
                0
            };
            let region = provider.allocate(req_capacity.max(1), alignment)?;
            let raw = super::arena::RawAlloc {
                ptr: region.base(),
                offset: 0,
                max_length: region.size(),
                storage: super::arena::RawStorage::Unpooled { region },
            };
            return Ok(PooledBuf::from_raw(
                None,
                self.id,
                raw,
                req_capacity,
                max_capacity,
                provider,
            ));
        }

        self.with_thread_cache(|cache| {
            let cache = cache.expect("registry creates a cache when arenas exist");
            let arena = cache
                .arena_for(prefer_direct)
                .expect("cache pinned to an arena of this kind")
                .clone();
            let raw = arena.allocate(Some(cache), req_capacity)?;
            Ok(PooledBuf::from_raw(
                Some(arena),
                self.id,
                raw,
                req_capacity,
                max_capacity,
                provider,
            ))
        })
    }

    /// Heap buffer with unbounded growth.
    pub fn heap_buffer(&self, req_capacity: usize) -> Result<PooledBuf, PoolError> {
        self.allocate(req_capacity, usize::MAX, false)
    }

    /// Direct buffer with unbounded growth.
    pub fn direct_buffer(&self, req_capacity: usize) -> Result<PooledBuf, PoolError> {
        self.allocate(req_capacity, usize::MAX, true)
    }

    /// Move `buf` onto storage of `new_capacity` bytes, copying the common
    /// prefix; `free_old` releases the old block.
    pub fn reallocate(
        &self,
        buf: &mut PooledBuf,
        new_capacity: usize,
        free_old: bool,
    ) -> Result<(), PoolError> {
        debug_assert_eq!(buf.allocator_id(), self.id, "buffer from another allocator");
        if buf.has_arena() {
            self.with_thread_cache(|cache| buf.reallocate_in_arena(new_capacity, free_old, cache))
        } else {
            buf.reallocate_unpooled(new_capacity, free_old)
        }
    }

    /// Growth policy for the user layer: double from 64 below the 4 MiB
    /// threshold, then step by whole thresholds, saturating at
    /// `max_capacity`.
    pub fn calculate_new_capacity(
        &self,
        min_new_capacity: usize,
        max_capacity: usize,
    ) -> Result<usize, PoolError> {
        if min_new_capacity > max_capacity {
            return Err(PoolError::CapacityExceeded {
                requested: min_new_capacity,
                max: max_capacity,
            });
        }

        if min_new_capacity == CALCULATE_THRESHOLD {
            return Ok(CALCULATE_THRESHOLD);
        }

        if min_new_capacity > CALCULATE_THRESHOLD {
            let mut new_capacity = min_new_capacity / CALCULATE_THRESHOLD * CALCULATE_THRESHOLD;
            if new_capacity > max_capacity - CALCULATE_THRESHOLD {
                new_capacity = max_capacity;
            } else {
                new_capacity += CALCULATE_THRESHOLD;
            }
            return Ok(new_capacity);
        }

        let mut new_capacity = 64usize;
        while new_capacity < min_new_capacity {
            new_capacity <<= 1;
        }
        Ok(new_capacity.min(max_capacity))
    }

    /// Read-only snapshot of every arena.
    pub fn metric(&self) -> AllocatorMetrics {
        AllocatorMetrics {
            heap_arenas: self.heap_arenas.iter().map(|a| a.metrics()).collect(),
            direct_arenas: self.direct_arenas.iter().map(|a| a.metrics()).collect(),
        }
    }

    /// Run the decay pass on the calling thread's cache now (the hook an
    /// external timer drives). Returns false when the thread has no cache.
    pub fn trim_current_thread_cache(&self) -> bool {
        THREAD_CACHES.with(|cell| {
            let mut slots = cell.borrow_mut();
            match slots.iter_mut().find(|s| s.allocator_id == self.id) {
                Some(slot) => {
                    slot.cache.trim();
                    true
                }
                None => false,
            }
        })
    }

    /// Drop the calling thread's cache, returning every entry to its arena.
    pub fn free_current_thread_cache(&self) -> bool {
        THREAD_CACHES.with(|cell| {
            let mut slots = cell.borrow_mut();
            match slots.iter().position(|s| s.allocator_id == self.id) {
                Some(pos) => {
                    slots.remove(pos);
                    true
                }
                None => false,
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn heap_arena(&self, idx: usize) -> &Arc<PoolArena> {
        &self.heap_arenas[idx]
    }

    fn with_thread_cache<R>(&self, f: impl FnOnce(Option<&mut PoolThreadCache>) -> R) -> R {
        THREAD_CACHES.with(|cell| {
            let mut slots = cell.borrow_mut();
            let pos = match slots.iter().position(|s| s.allocator_id == self.id) {
                Some(pos) => pos,
                None => {
                    slots.push(CacheSlot {
                        allocator_id: self.id,
                        cache: Box::new(self.new_thread_cache()),
                    });
                    slots.len() - 1
                }
            };
            f(Some(&mut slots[pos].cache))
        })
    }

    /// First allocation on a thread: pin the least-loaded arena of each kind
    /// and size the queues (zero when caching is disabled for plain threads).
    fn new_thread_cache(&self) -> PoolThreadCache {
        let (small_cache_size, normal_cache_size) = if self.config.use_cache_for_all_threads {
            (self.config.small_cache_size, self.config.normal_cache_size)
        } else {
            (0, 0)
        };
        PoolThreadCache::new(
            least_used(&self.heap_arenas),
            least_used(&self.direct_arenas),
            small_cache_size,
            normal_cache_size,
            self.config.max_cached_buffer_capacity,
            self.config.cache_trim_interval,
        )
    }
}

fn least_used(arenas: &[Arc<PoolArena>]) -> Option<Arc<PoolArena>> {
    arenas
        .iter()
        .min_by_key(|a| a.num_thread_caches.load(Ordering::Relaxed))
        .cloned()
}

// ---------------------------------------------------------------------------
// thread-cache registry
// ---------------------------------------------------------------------------

struct CacheSlot {
    allocator_id: u64,
    cache: Box<PoolThreadCache>,
}

thread_local! {
    /// Caches of every allocator this thread has touched. Dropped at thread
    /// exit, returning all entries to their arenas.
    static THREAD_CACHES: RefCell<Vec<CacheSlot>> = const { RefCell::new(Vec::new()) };
}

/// Run `free` with the calling thread's cache for `allocator_id`, if it is
/// accessible; otherwise with no cache. Buffers dropped during thread
/// teardown (or from inside a registry access) fall back to the direct arena
/// path instead of touching the registry.
pub(crate) fn free_with_cache(allocator_id: u64, free: impl FnOnce(Option<&mut PoolThreadCache>)) {
    let mut free = Some(free);
    let done = THREAD_CACHES
        .try_with(|cell| {
            if let Ok(mut slots) = cell.try_borrow_mut() {
                if let Some(slot) = slots.iter_mut().find(|s| s.allocator_id == allocator_id) {
                    (free.take().expect("closure consumed twice"))(Some(&mut slot.cache));
                    return true;
                }
            }
            false
        })
        .unwrap_or(false);
    if !done {
        if let Some(f) = free.take() {
            f(None);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn single_arena_config() -> PooledAllocatorConfig {
        PooledAllocatorConfig {
            num_heap_arenas: 1,
            num_direct_arenas: 1,
            use_cache_for_all_threads: false,
            ..PooledAllocatorConfig::default()
        }
    }

    #[test]
    fn test_config_rejects_bad_page_size() {
        for page_size in [0usize, 1024, 5000, 8191] {
            let config = PooledAllocatorConfig {
                page_size,
                ..PooledAllocatorConfig::default()
            };
            assert!(matches!(
                PooledAllocator::with_config(config),
                Err(PoolError::ConfigInvalid(_))
            ));
        }
    }

    #[test]
    fn test_config_rejects_bad_alignment() {
        for alignment in [3usize, 16384] {
            let config = PooledAllocatorConfig {
                direct_memory_cache_alignment: alignment,
                ..single_arena_config()
            };
            assert!(matches!(
                PooledAllocator::with_config(config),
                Err(PoolError::ConfigInvalid(_))
            ));
        }
    }

    #[test]
    fn test_config_rejects_bad_max_order() {
        let config = PooledAllocatorConfig {
            max_order: 15,
            ..PooledAllocatorConfig::default()
        };
        assert!(matches!(
            PooledAllocator::with_config(config),
            Err(PoolError::ConfigInvalid(_))
        ));

        // 64 KiB pages with maxOrder 14 would exceed the 1 GiB chunk cap.
        let config = PooledAllocatorConfig {
            page_size: 64 * 1024 * 16,
            max_order: 14,
            ..PooledAllocatorConfig::default()
        };
        assert!(matches!(
            PooledAllocator::with_config(config),
            Err(PoolError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_allocate_rejects_req_over_max() {
        let alloc = PooledAllocator::with_config(single_arena_config()).unwrap();
        assert!(matches!(
            alloc.allocate(1024, 512, false),
            Err(PoolError::SizeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_calculate_new_capacity() {
        let alloc = PooledAllocator::with_config(single_arena_config()).unwrap();
        const T: usize = CALCULATE_THRESHOLD;

        // Exactly the threshold.
        assert_eq!(alloc.calculate_new_capacity(T, usize::MAX).unwrap(), T);
        // Below: doubling from 64.
        assert_eq!(alloc.calculate_new_capacity(0, usize::MAX).unwrap(), 64);
        assert_eq!(alloc.calculate_new_capacity(65, usize::MAX).unwrap(), 128);
        assert_eq!(
            alloc.calculate_new_capacity(T - 1, usize::MAX).unwrap(),
            T
        );
        // Doubling clamps to max.
        assert_eq!(alloc.calculate_new_capacity(65, 100).unwrap(), 100);
        // Above: step by whole thresholds.
        assert_eq!(
            alloc.calculate_new_capacity(T + 1, usize::MAX).unwrap(),
            2 * T
        );
        assert_eq!(
            alloc.calculate_new_capacity(3 * T + 5, usize::MAX).unwrap(),
            4 * T
        );
        // Saturates when one more threshold would overshoot.
        assert_eq!(
            alloc.calculate_new_capacity(3 * T + 5, 3 * T + 100).unwrap(),
            3 * T + 100
        );
        // min above max is an error.
        assert!(matches!(
            alloc.calculate_new_capacity(11, 10),
            Err(PoolError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_pooling_disabled_falls_back_to_regions() {
        let config = PooledAllocatorConfig {
            num_heap_arenas: 0,
            num_direct_arenas: 0,
            ..PooledAllocatorConfig::default()
        };
        let alloc = PooledAllocator::with_config(config).unwrap();
        let mut buf = alloc.heap_buffer(1000).unwrap();
        buf.as_mut_slice().fill(7);
        assert_eq!(buf.len(), 1000);
        assert!(buf.as_slice().iter().all(|&b| b == 7));

        let metric = alloc.metric();
        assert_eq!(metric.num_heap_arenas(), 0);
        assert_eq!(metric.num_direct_arenas(), 0);
    }

    #[test]
    fn test_least_used_arena_balancing() {
        let config = PooledAllocatorConfig {
            num_heap_arenas: 4,
            num_direct_arenas: 0,
            ..PooledAllocatorConfig::default()
        };
        let alloc = Arc::new(PooledAllocator::with_config(config).unwrap());
        let exit_barrier = Arc::new(crate::sync::barrier::Barrier::new(5));

        // Pin caches strictly one thread at a time (each waits for its go
        // token), with every cache held alive until the end, so the
        // least-loaded choice is deterministic round-robin.
        let mut handles = Vec::new();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        for _ in 0..4 {
            let alloc = alloc.clone();
            let barrier = exit_barrier.clone();
            let done = done_tx.clone();
            let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
            handles.push((
                go_tx,
                crate::sync::thread::spawn(move || {
                    go_rx.recv().unwrap();
                    let _buf = alloc.heap_buffer(128).unwrap();
                    done.send(()).unwrap();
                    barrier.wait();
                }),
            ));
        }
        for (go, _) in &handles {
            go.send(()).unwrap();
            done_rx.recv().unwrap();
        }

        // All four caches are live: every arena serves exactly one thread.
        let metric = alloc.metric();
        for arena in &metric.heap_arenas {
            assert_eq!(arena.num_thread_caches, 1);
            assert_eq!(arena.num_allocations(), 1);
        }

        exit_barrier.wait();
        for (_, h) in handles {
            h.join().unwrap();
        }
    }
}
