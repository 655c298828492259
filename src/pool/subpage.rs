//! Subpage slot pools for Small size classes.
//!
//! A subpage reinterprets one run as `runSize / elemSize` equal slots tracked
//! by a bitmap. All subpages of one element size belong to that size class's
//! [`SubpageDirectory`], which owns them and keeps an availability stack
//! standing in for the original design's head-inserted intrusive free list
//! (top of stack = most recently available, "only member" = stack length 1).
//! Each directory sits behind its own mutex in the arena — the per-size
//! sentinel lock — which is always acquired before the arena mutex when both
//! are needed.

use super::chunk::ChunkId;
use super::handle::Handle;
use super::size_class::{LOG2_QUANTUM, SizeClasses};
use fixedbitset::FixedBitSet;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Identity of a subpage: owning chunk and first page of its run.
pub(crate) type SubpageKey = (ChunkId, u32);

/// Outcome of returning a slot.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SlotFree {
    /// The subpage stays alive (still has allocated slots, or is kept to
    /// avoid churn).
    Alive,
    /// The subpage was fully free and retired; the caller releases its run.
    Dead,
}

/// Run size for a fresh subpage of class `size_idx`: the least common
/// multiple of page size and element size, capped so a subpage never holds
/// more than `1 << (pageShifts - LOG2_QUANTUM)` elements.
pub(crate) fn calculate_run_size(sc: &SizeClasses, size_idx: usize) -> usize {
    let max_elements = 1usize << (sc.page_shifts() - LOG2_QUANTUM);
    let page_size = sc.page_size();
    let elem_size = sc.size_idx2size(size_idx);

    let mut run_size = 0;
    let mut n_elements;
    loop {
        run_size += page_size;
        n_elements = run_size / elem_size;
        if n_elements >= max_elements || run_size == n_elements * elem_size {
            break;
        }
    }
    while n_elements > max_elements {
        run_size -= page_size;
        n_elements = run_size / elem_size;
    }

    debug_assert!(n_elements > 0);
    debug_assert!(run_size <= sc.chunk_size());
    debug_assert!(run_size >= elem_size);
    run_size
}

pub(crate) struct PoolSubpage {
    pub chunk: ChunkId,
    /// Base address of the owning chunk's region, captured at creation so
    /// slot addresses resolve without the arena lock.
    pub chunk_base: NonNull<u8>,
    pub run_offset: usize,
    pub run_size: usize,
    pub elem_size: usize,
    pub max_num_elems: usize,
    pub num_avail: usize,
    /// Most recently freed slot, consulted before scanning the bitmap.
    next_avail: isize,
    /// One bit per slot: 0 = free, 1 = in use. Bits beyond `max_num_elems`
    /// are never consulted.
    bitmap: FixedBitSet,
    pub do_not_destroy: bool,
}

// Safety: chunk_base points into a region owned by the arena that also owns
// this subpage; the directory may move across threads behind its mutex.
unsafe impl Send for PoolSubpage {}

impl PoolSubpage {
    pub fn new(
        chunk: ChunkId,
        chunk_base: NonNull<u8>,
        run_offset: usize,
        run_size: usize,
        elem_size: usize,
    ) -> Self {
        let max_num_elems = run_size / elem_size;
        debug_assert!(max_num_elems > 0);
        Self {
            chunk,
            chunk_base,
            run_offset,
            run_size,
            elem_size,
            max_num_elems,
            num_avail: max_num_elems,
            next_avail: 0,
            bitmap: FixedBitSet::with_capacity(max_num_elems),
            do_not_destroy: true,
        }
    }

    /// Claim one slot. Returns `Handle::NONE` when no slot is available or
    /// the subpage is already retired.
    pub fn allocate(&mut self, page_shifts: u32) -> Handle {
        if self.num_avail == 0 || !self.do_not_destroy {
            return Handle::NONE;
        }

        let bitmap_idx = match self.next_avail_slot() {
            Some(idx) => idx,
            None => return Handle::NONE,
        };
        debug_assert!(!self.bitmap.contains(bitmap_idx));
        self.bitmap.insert(bitmap_idx);
        self.num_avail -= 1;

        Handle::new_subpage(self.run_offset, self.run_size >> page_shifts, bitmap_idx)
    }

    fn next_avail_slot(&mut self) -> Option<usize> {
        if self.next_avail >= 0 {
            let idx = self.next_avail as usize;
            self.next_avail = -1;
            return Some(idx);
        }
        (0..self.max_num_elems).find(|&i| !self.bitmap.contains(i))
    }

    #[cfg(test)]
    pub fn check_integrity(&self) {
        assert_eq!(
            self.num_avail,
            self.max_num_elems - self.bitmap.count_ones(..self.max_num_elems),
        );
    }
}

/// All live subpages of one Small size class, plus the free-list state.
pub(crate) struct SubpageDirectory {
    subpages: HashMap<SubpageKey, PoolSubpage>,
    /// Keys of subpages with at least one free slot; top of stack is the
    /// list head. A full subpage is detached (absent) until a slot frees.
    avail: Vec<SubpageKey>,
}

impl SubpageDirectory {
    pub fn new() -> Self {
        Self {
            subpages: HashMap::new(),
            avail: Vec::new(),
        }
    }

    /// Install a freshly created subpage and head-insert it into the free
    /// list.
    pub fn insert(&mut self, subpage: PoolSubpage) -> SubpageKey {
        debug_assert!(subpage.num_avail > 0 && subpage.do_not_destroy);
        let key = (subpage.chunk, subpage.run_offset as u32);
        let prev = self.subpages.insert(key, subpage);
        debug_assert!(prev.is_none(), "subpage already installed at {key:?}");
        self.avail.push(key);
        key
    }

    /// Allocate a slot from the free-list head. `None` when the list is
    /// empty (the caller then creates a fresh subpage).
    pub fn allocate(&mut self, page_shifts: u32) -> Option<(ChunkId, Handle, NonNull<u8>)> {
        let &key = self.avail.last()?;
        let subpage = self
            .subpages
            .get_mut(&key)
            .expect("free list references unknown subpage");
        debug_assert!(subpage.do_not_destroy && subpage.num_avail > 0);

        let handle = subpage.allocate(page_shifts);
        debug_assert!(!handle.is_none());
        let base = subpage.chunk_base;

        if subpage.num_avail == 0 {
            // Exhausted: detach from the free list until a slot frees.
            self.avail.pop();
        }
        Some((key.0, handle, base))
    }

    /// Return a slot. `Dead` means the subpage was retired and its run must
    /// be released by the caller.
    pub fn free(&mut self, key: SubpageKey, bitmap_idx: usize) -> SlotFree {
        let subpage = self
            .subpages
            .get_mut(&key)
            .expect("freeing slot of unknown subpage");
        assert!(subpage.do_not_destroy);
        assert!(
            subpage.bitmap.contains(bitmap_idx),
            "double free of subpage slot {bitmap_idx}"
        );

        subpage.bitmap.set(bitmap_idx, false);
        subpage.next_avail = bitmap_idx as isize;

        let was_full = subpage.num_avail == 0;
        subpage.num_avail += 1;

        if was_full {
            // Back from exhausted: rejoin the free list at the head.
            self.avail.push(key);
        }

        // A single-slot subpage goes straight from full to empty on every
        // free; retiring it each time would thrash, so it always survives.
        if subpage.max_num_elems == 1 {
            return SlotFree::Alive;
        }

        if subpage.num_avail != subpage.max_num_elems {
            return SlotFree::Alive;
        }

        // Fully free. Keep the last free-listed subpage of this size to
        // avoid immediate reallocation of the run.
        if self.avail.len() == 1 {
            debug_assert_eq!(self.avail[0], key);
            return SlotFree::Alive;
        }

        subpage.do_not_destroy = false;
        let pos = self
            .avail
            .iter()
            .position(|&k| k == key)
            .expect("retiring subpage missing from free list");
        self.avail.remove(pos);
        self.subpages.remove(&key);
        SlotFree::Dead
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.subpages.is_empty()
    }

    /// `(elem_size, max_num_elems, num_avail, in_free_list)` per live
    /// subpage.
    pub fn snapshot(&self) -> Vec<(usize, usize, usize, bool)> {
        self.subpages
            .iter()
            .map(|(key, sp)| {
                (
                    sp.elem_size,
                    sp.max_num_elems,
                    sp.num_avail,
                    self.avail.contains(key),
                )
            })
            .collect()
    }

    #[cfg(test)]
    pub fn check_integrity(&self) {
        for (key, sp) in &self.subpages {
            sp.check_integrity();
            assert_eq!(
                self.avail.contains(key),
                sp.num_avail > 0 && sp.do_not_destroy,
                "free-list membership out of sync for {key:?}"
            );
        }
        for key in &self.avail {
            assert!(self.subpages.contains_key(key));
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const PAGE_SHIFTS: u32 = 13;

    fn subpage(elem_size: usize, run_size: usize) -> PoolSubpage {
        PoolSubpage::new(0, NonNull::dangling(), 0, run_size, elem_size)
    }

    #[test]
    fn test_calculate_run_size_lcm() {
        let sc = SizeClasses::new(8192, 13, 16 * 1024 * 1024, 0);
        // 256 B divides the page: one page suffices.
        let idx = sc.size2size_idx(256);
        assert_eq!(calculate_run_size(&sc, idx), 8192);
        // 48 B does not divide 8192; the run grows to the LCM (3 pages).
        let idx = sc.size2size_idx(48);
        let run = calculate_run_size(&sc, idx);
        assert_eq!(run % 8192, 0);
        assert_eq!(run % 48, 0);
        assert_eq!(run, 3 * 8192);
        // Element count never exceeds the cap.
        for si in 0..=sc.small_max_size_idx() {
            let run = calculate_run_size(&sc, si);
            assert!(run / sc.size_idx2size(si) <= 1 << (13 - LOG2_QUANTUM));
        }
    }

    #[test]
    fn test_allocate_fills_all_slots() {
        let mut sp = subpage(256, 8192);
        assert_eq!(sp.max_num_elems, 32);
        for expected in 0..32 {
            let h = sp.allocate(PAGE_SHIFTS);
            assert!(!h.is_none());
            assert!(h.is_subpage() && h.is_used());
            assert_eq!(h.bitmap_idx(), expected);
            sp.check_integrity();
        }
        assert_eq!(sp.num_avail, 0);
        assert!(sp.allocate(PAGE_SHIFTS).is_none());
    }

    #[test]
    fn test_free_hint_reuses_slot() {
        let mut dir = SubpageDirectory::new();
        let key = dir.insert(subpage(512, 8192));

        let (_, h1, _) = dir.allocate(PAGE_SHIFTS).unwrap();
        let (_, h2, _) = dir.allocate(PAGE_SHIFTS).unwrap();
        assert_ne!(h1.bitmap_idx(), h2.bitmap_idx());

        assert_eq!(dir.free(key, h1.bitmap_idx()), SlotFree::Alive);
        let (_, h3, _) = dir.allocate(PAGE_SHIFTS).unwrap();
        assert_eq!(h3.bitmap_idx(), h1.bitmap_idx());
        dir.check_integrity();
    }

    #[test]
    fn test_full_subpage_detaches_and_rejoins() {
        let mut dir = SubpageDirectory::new();
        let key = dir.insert(subpage(4096, 8192));

        let (_, h1, _) = dir.allocate(PAGE_SHIFTS).unwrap();
        let (_, _h2, _) = dir.allocate(PAGE_SHIFTS).unwrap();
        // Both slots taken: detached.
        assert!(dir.allocate(PAGE_SHIFTS).is_none());
        dir.check_integrity();

        assert_eq!(dir.free(key, h1.bitmap_idx()), SlotFree::Alive);
        assert!(dir.allocate(PAGE_SHIFTS).is_some());
    }

    #[test]
    fn test_last_subpage_is_kept_alive() {
        let mut dir = SubpageDirectory::new();
        let key = dir.insert(subpage(512, 8192));

        let (_, h, _) = dir.allocate(PAGE_SHIFTS).unwrap();
        // Fully free again, but it is the only subpage of its size: keep it.
        assert_eq!(dir.free(key, h.bitmap_idx()), SlotFree::Alive);
        assert!(!dir.is_empty());
        dir.check_integrity();
    }

    #[test]
    fn test_fully_free_subpage_retires_when_another_exists() {
        let mut dir = SubpageDirectory::new();
        let key_a = dir.insert(subpage(512, 8192)); // 16 slots
        let mut second = subpage(512, 8192);
        second.chunk = 1;
        let key_b = dir.insert(second);

        // The head is B: fill it completely (16 slots), detaching it, then
        // take one slot from A.
        let b_handles: Vec<Handle> = (0..16)
            .map(|_| dir.allocate(PAGE_SHIFTS).unwrap().1)
            .collect();
        let b_handle = *b_handles.last().unwrap();
        let (_, ha, _) = dir.allocate(PAGE_SHIFTS).unwrap();
        dir.check_integrity();

        // Put B back on the free list, then fully free A: with another
        // free-listed subpage of the same size, A retires.
        assert_eq!(dir.free(key_b, b_handle.bitmap_idx()), SlotFree::Alive);
        assert_eq!(dir.free(key_a, ha.bitmap_idx()), SlotFree::Dead);
        assert_eq!(dir.snapshot().len(), 1);
        dir.check_integrity();
    }

    #[test]
    fn test_single_slot_subpage_never_retires() {
        let mut dir = SubpageDirectory::new();
        let key = dir.insert(subpage(8192, 8192));
        let mut other = subpage(8192, 8192);
        other.chunk = 7;
        dir.insert(other);

        for _ in 0..3 {
            // Head is the other subpage; drain both to reach key.
            let (_, h1, _) = dir.allocate(PAGE_SHIFTS).unwrap();
            let (_, h2, _) = dir.allocate(PAGE_SHIFTS).unwrap();
            // Every free of a one-slot subpage reports Alive, even with a
            // second subpage of the same size on the free list.
            assert_eq!(dir.free((7, 0), h1.bitmap_idx()), SlotFree::Alive);
            assert_eq!(dir.free(key, h2.bitmap_idx()), SlotFree::Alive);
        }
        assert_eq!(dir.snapshot().len(), 2);
        dir.check_integrity();
    }
}
