//! Read-only metrics snapshots.
//!
//! Counter values come from relaxed atomics and mutex-guarded integers read
//! at different instants; a snapshot is internally consistent per field, not
//! across fields. Diagnostic display only.

/// Snapshot of one allocator: all arenas of both kinds.
#[derive(Debug, Clone)]
pub struct AllocatorMetrics {
    pub heap_arenas: Vec<ArenaMetrics>,
    pub direct_arenas: Vec<ArenaMetrics>,
}

impl AllocatorMetrics {
    pub fn num_heap_arenas(&self) -> usize {
        self.heap_arenas.len()
    }

    pub fn num_direct_arenas(&self) -> usize {
        self.direct_arenas.len()
    }
}

/// Snapshot of a single arena.
#[derive(Debug, Clone)]
pub struct ArenaMetrics {
    pub is_direct: bool,
    /// Thread caches currently pinned to this arena.
    pub num_thread_caches: usize,

    pub allocations_small: usize,
    pub allocations_normal: u64,
    pub allocations_huge: usize,
    pub deallocations_small: u64,
    pub deallocations_normal: u64,
    pub deallocations_huge: usize,

    /// Bytes of live huge regions.
    pub active_bytes_huge: usize,
    /// Huge bytes plus the full size of every pooled chunk.
    pub active_bytes: usize,
    /// Live pooled chunks.
    pub num_chunks: usize,

    /// One entry per chunk list, `qInit` first.
    pub chunk_lists: Vec<ChunkListMetrics>,
    /// Every live subpage, across all Small size classes.
    pub subpages: Vec<SubpageMetrics>,
}

impl ArenaMetrics {
    pub fn num_allocations(&self) -> u64 {
        self.allocations_small as u64 + self.allocations_normal + self.allocations_huge as u64
    }

    pub fn num_deallocations(&self) -> u64 {
        self.deallocations_small + self.deallocations_normal + self.deallocations_huge as u64
    }

    pub fn num_active_allocations(&self) -> u64 {
        self.num_allocations().saturating_sub(self.num_deallocations())
    }

    pub fn num_active_small_allocations(&self) -> u64 {
        (self.allocations_small as u64).saturating_sub(self.deallocations_small)
    }

    pub fn num_active_normal_allocations(&self) -> u64 {
        self.allocations_normal.saturating_sub(self.deallocations_normal)
    }

    pub fn num_active_huge_allocations(&self) -> u64 {
        (self.allocations_huge as u64).saturating_sub(self.deallocations_huge as u64)
    }
}

/// Snapshot of one usage band.
#[derive(Debug, Clone)]
pub struct ChunkListMetrics {
    pub min_usage: u32,
    pub max_usage: u32,
    /// Member chunks, head to tail.
    pub chunks: Vec<ChunkMetrics>,
}

/// Snapshot of one pooled chunk.
#[derive(Debug, Clone)]
pub struct ChunkMetrics {
    pub usage: u32,
    pub free_bytes: usize,
    pub chunk_size: usize,
}

/// Snapshot of one live subpage.
#[derive(Debug, Clone)]
pub struct SubpageMetrics {
    pub elem_size: usize,
    pub max_num_elems: usize,
    pub num_avail: usize,
    /// Whether the subpage currently sits in its size class's free list.
    pub in_free_list: bool,
}
