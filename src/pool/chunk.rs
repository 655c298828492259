//! A fixed-size memory region managed as runs of pages.
//!
//! A chunk subdivides its region into variable-length runs. Free runs are
//! indexed twice:
//!
//! - `runs_avail`: one offset-ordered queue per page index, keyed by
//!   `pages2pageIdxFloor(runPages)`, so a best-fit scan walks at most
//!   `nPSizes` queues and always reuses the lowest-address run;
//! - `runs_avail_map`: both endpoints of every free run map to its handle,
//!   which makes the free-time coalesce of adjacent runs O(1) per neighbour.
//!
//! At rest (outside an allocate/free critical section): every free run is in
//! exactly one queue, both its endpoints are mapped, the sum of free-run
//! sizes equals `free_bytes`, and no two free runs are adjacent.
//!
//! All mutation happens under the owning arena's mutex; the chunk itself has
//! no interior locking.

use super::handle::Handle;
use super::region::Region;
use super::run_map::RunMap;
use super::run_queue::RunQueue;
use super::size_class::SizeClasses;
use std::ptr::NonNull;

/// Index of a chunk slot inside its arena.
pub(crate) type ChunkId = u32;

/// `list` value of a chunk that is not linked into any chunk list.
pub(crate) const LIST_NONE: u8 = u8::MAX;

pub(crate) struct PoolChunk {
    region: Region,
    page_shifts: u32,
    chunk_size: usize,

    pub free_bytes: usize,

    runs_avail: Box<[RunQueue]>,
    runs_avail_map: RunMap,

    /// `subpages[off]` is true iff a subpage currently occupies the run
    /// starting at page offset `off`.
    subpages: Box<[bool]>,

    // Chunk-list linkage, maintained by the arena under its lock. Indices
    // instead of pointers: the list owns the chunk, the chunk only remembers
    // where it is linked so migrations can unlink in O(1).
    pub list: u8,
    pub prev: Option<ChunkId>,
    pub next: Option<ChunkId>,
}

impl PoolChunk {
    pub fn new(region: Region, sc: &SizeClasses) -> Self {
        let page_shifts = sc.page_shifts();
        let chunk_size = sc.chunk_size();
        debug_assert!(region.size() >= chunk_size);

        let pages = chunk_size >> page_shifts;
        let mut chunk = Self {
            region,
            page_shifts,
            chunk_size,
            free_bytes: chunk_size,
            runs_avail: (0..sc.n_psizes()).map(|_| RunQueue::new()).collect(),
            runs_avail_map: RunMap::new(),
            subpages: vec![false; pages].into_boxed_slice(),
            list: LIST_NONE,
            prev: None,
            next: None,
        };

        // The initial run spans the whole chunk.
        chunk.insert_avail_run(Handle::new_run(0, pages, false), sc);
        chunk
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    /// Occupancy percentage in `[0, 100]`. A chunk with any free byte never
    /// reports 100, and a chunk whose free share rounds to zero reports 99.
    pub fn usage(&self) -> u32 {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_percentage = (self.free_bytes * 100 / self.chunk_size) as u32;
        if free_percentage == 0 {
            return 99;
        }
        100 - free_percentage
    }

    #[inline]
    pub fn has_subpage(&self, run_offset: usize) -> bool {
        self.subpages[run_offset]
    }

    #[inline]
    pub fn set_subpage(&mut self, run_offset: usize, present: bool) {
        debug_assert_ne!(self.subpages[run_offset], present);
        self.subpages[run_offset] = present;
    }

    // ------------------------------------------------------------------
    // run allocation
    // ------------------------------------------------------------------

    /// Allocate a run of `run_size` bytes (a multiple of the page size).
    /// Returns an in-use run handle, or `Handle::NONE` when nothing fits.
    pub fn allocate_run(&mut self, run_size: usize, sc: &SizeClasses) -> Handle {
        let pages = run_size >> self.page_shifts;
        debug_assert!(pages > 0 && pages << self.page_shifts == run_size);
        let page_idx = sc.pages2page_idx(pages);

        let Some(queue_idx) = self.run_first_best_fit(page_idx, sc) else {
            return Handle::NONE;
        };

        let handle = self.runs_avail[queue_idx].poll();
        debug_assert!(
            !handle.is_none() && !handle.is_used(),
            "invalid free-run handle: {handle:?}"
        );
        self.remove_avail_map_entries(handle);

        let handle = self.split_large_run(handle, pages, sc);
        self.free_bytes -= handle.run_size(self.page_shifts);
        handle
    }

    /// First queue at or above `page_idx` holding a run. An untouched chunk
    /// has exactly one run in the top queue, so skip the scan.
    fn run_first_best_fit(&self, page_idx: usize, sc: &SizeClasses) -> Option<usize> {
        if self.free_bytes == self.chunk_size {
            return Some(sc.n_psizes() - 1);
        }
        (page_idx..sc.n_psizes()).find(|&i| !self.runs_avail[i].is_empty())
    }

    /// Split off `need_pages` from the front of a free run, re-registering
    /// the tail for later use. Returns the head marked in-use.
    fn split_large_run(&mut self, handle: Handle, need_pages: usize, sc: &SizeClasses) -> Handle {
        debug_assert!(need_pages > 0);
        let total_pages = handle.run_pages();
        debug_assert!(need_pages <= total_pages);

        let rem_pages = total_pages - need_pages;
        let run_offset = handle.run_offset();

        if rem_pages > 0 {
            let tail = Handle::new_run(run_offset + need_pages, rem_pages, false);
            self.insert_avail_run(tail, sc);
        }
        Handle::new_run(run_offset, need_pages, true)
    }

    // ------------------------------------------------------------------
    // free + coalesce
    // ------------------------------------------------------------------

    /// Release a run (or a dead subpage's underlying run), merging with any
    /// adjacent free runs.
    pub fn free_run(&mut self, handle: Handle, sc: &SizeClasses) {
        assert!(
            handle.is_used(),
            "handle offered for free is not in use: {handle:?}"
        );
        let pages = handle.run_pages();

        let merged = self.collapse_past(handle, sc);
        let merged = self.collapse_next(merged, sc).as_free_run();
        self.insert_avail_run(merged, sc);

        self.free_bytes += pages << self.page_shifts;
    }

    fn collapse_past(&mut self, mut handle: Handle, sc: &SizeClasses) -> Handle {
        loop {
            let run_offset = handle.run_offset();
            let run_pages = handle.run_pages();
            if run_offset == 0 {
                return handle;
            }

            let past = self.runs_avail_map.get(run_offset - 1);
            if past.is_none() {
                return handle;
            }

            let past_offset = past.run_offset();
            let past_pages = past.run_pages();
            if past != handle && past_offset + past_pages == run_offset {
                self.remove_avail_run(past, sc);
                handle = Handle::new_run(past_offset, past_pages + run_pages, false);
            } else {
                return handle;
            }
        }
    }

    fn collapse_next(&mut self, mut handle: Handle, sc: &SizeClasses) -> Handle {
        loop {
            let run_offset = handle.run_offset();
            let run_pages = handle.run_pages();

            let next = self.runs_avail_map.get(run_offset + run_pages);
            if next.is_none() {
                return handle;
            }

            let next_offset = next.run_offset();
            let next_pages = next.run_pages();
            if next != handle && run_offset + run_pages == next_offset {
                self.remove_avail_run(next, sc);
                handle = Handle::new_run(run_offset, run_pages + next_pages, false);
            } else {
                return handle;
            }
        }
    }

    // ------------------------------------------------------------------
    // availability indices
    // ------------------------------------------------------------------

    fn insert_avail_run(&mut self, handle: Handle, sc: &SizeClasses) {
        let pages = handle.run_pages();
        let queue_idx = sc.pages2page_idx_floor(pages);
        self.runs_avail[queue_idx].offer(handle);

        let run_offset = handle.run_offset();
        self.insert_avail_map(run_offset, handle);
        if pages > 1 {
            self.insert_avail_map(run_offset + pages - 1, handle);
        }
    }

    fn insert_avail_map(&mut self, page_offset: usize, handle: Handle) {
        let prev = self.runs_avail_map.put(page_offset, handle);
        debug_assert!(prev.is_none(), "offset {page_offset} already mapped");
    }

    fn remove_avail_run(&mut self, handle: Handle, sc: &SizeClasses) {
        let queue_idx = sc.pages2page_idx_floor(handle.run_pages());
        let removed = self.runs_avail[queue_idx].remove(handle);
        debug_assert!(removed, "free run missing from its queue: {handle:?}");
        self.remove_avail_map_entries(handle);
    }

    fn remove_avail_map_entries(&mut self, handle: Handle) {
        let run_offset = handle.run_offset();
        let pages = handle.run_pages();
        self.runs_avail_map.remove(run_offset);
        if pages > 1 {
            self.runs_avail_map.remove(run_offset + pages - 1);
        }
    }

    // ------------------------------------------------------------------
    // integrity (tests only)
    // ------------------------------------------------------------------

    /// Collect `(offset, pages)` of every registered free run.
    #[cfg(test)]
    pub fn free_runs(&self) -> Vec<(usize, usize)> {
        let mut runs: Vec<(usize, usize)> = self
            .runs_avail
            .iter()
            .flat_map(|q| q.iter())
            .map(|h| (h.run_offset(), h.run_pages()))
            .collect();
        runs.sort_unstable();
        runs
    }

    /// Assert the at-rest invariants of the availability indices.
    #[cfg(test)]
    pub fn check_integrity(&self, sc: &SizeClasses) {
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for (queue_idx, queue) in self.runs_avail.iter().enumerate() {
            for h in queue.iter() {
                assert!(!h.is_used() && !h.is_subpage(), "queued handle {h:?}");
                assert_eq!(
                    sc.pages2page_idx_floor(h.run_pages()),
                    queue_idx,
                    "run {h:?} in wrong queue"
                );
                assert_eq!(self.runs_avail_map.get(h.run_offset()), h);
                if h.run_pages() > 1 {
                    assert_eq!(
                        self.runs_avail_map.get(h.run_offset() + h.run_pages() - 1),
                        h
                    );
                }
                runs.push((h.run_offset(), h.run_pages()));
            }
        }

        let total: usize = runs.iter().map(|&(_, p)| p << self.page_shifts).sum();
        assert_eq!(total, self.free_bytes, "free-run sizes disagree with free_bytes");

        runs.sort_unstable();
        for pair in runs.windows(2) {
            assert!(
                pair[0].0 + pair[0].1 < pair[1].0,
                "adjacent free runs not coalesced: {pair:?}"
            );
        }
    }
}
