//! Usage-banded chunk lists.
//!
//! Six lists per arena hold pooled chunks grouped by occupancy:
//!
//! ```text
//!   qInit [0,25)   q000 [1,50)   q025 [25,75)
//!   q050 [50,100)  q075 [75,100) q100 {100}
//! ```
//!
//! `next` points toward higher usage, `prev` toward lower. `q000` has no
//! predecessor — a chunk migrating below it is destroyed — while `qInit`
//! loops to itself so freshly created chunks can never be destroyed by
//! freeing alone (its downward threshold is unreachable by construction,
//! which is what terminates the migration loop).
//!
//! Lists and chunks reference each other by index: the arena's `ChunkStorage`
//! owns every chunk, a list knows its head id, and each chunk carries its
//! list id plus prev/next ids so migrations unlink in O(1).

use super::chunk::{ChunkId, LIST_NONE, PoolChunk};
use super::handle::Handle;
use super::size_class::SizeClasses;

pub(crate) const Q_INIT: usize = 0;
pub(crate) const Q_000: usize = 1;
pub(crate) const Q_025: usize = 2;
pub(crate) const Q_050: usize = 3;
pub(crate) const Q_075: usize = 4;
pub(crate) const Q_100: usize = 5;
pub(crate) const N_LISTS: usize = 6;

/// Normal allocations start from mid-usage chunks: very-low-usage chunks
/// stay drainable and near-full chunks are not touched first. `q100` never
/// participates.
pub(crate) const ALLOCATION_ORDER: [usize; 5] = [Q_050, Q_025, Q_000, Q_INIT, Q_075];

const NEXT_LIST: [Option<usize>; N_LISTS] = [
    Some(Q_000),
    Some(Q_025),
    Some(Q_050),
    Some(Q_075),
    Some(Q_100),
    None,
];

const PREV_LIST: [Option<usize>; N_LISTS] = [
    Some(Q_INIT), // self-loop
    None,         // destruction edge
    Some(Q_000),
    Some(Q_025),
    Some(Q_050),
    Some(Q_075),
];

/// Slot table owning every pooled chunk of an arena. Ids are stable for the
/// chunk's lifetime and recycled after destruction.
pub(crate) struct ChunkStorage {
    slots: Vec<Option<Box<PoolChunk>>>,
    free_slots: Vec<ChunkId>,
}

impl ChunkStorage {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn insert(&mut self, chunk: Box<PoolChunk>) -> ChunkId {
        if let Some(id) = self.free_slots.pop() {
            debug_assert!(self.slots[id as usize].is_none());
            self.slots[id as usize] = Some(chunk);
            id
        } else {
            self.slots.push(Some(chunk));
            (self.slots.len() - 1) as ChunkId
        }
    }

    pub fn remove(&mut self, id: ChunkId) -> Box<PoolChunk> {
        let chunk = self.slots[id as usize]
            .take()
            .expect("removing vacant chunk slot");
        self.free_slots.push(id);
        chunk
    }

    #[inline]
    pub fn get(&self, id: ChunkId) -> &PoolChunk {
        self.slots[id as usize]
            .as_deref()
            .expect("vacant chunk slot")
    }

    #[inline]
    pub fn get_mut(&mut self, id: ChunkId) -> &mut PoolChunk {
        self.slots[id as usize]
            .as_deref_mut()
            .expect("vacant chunk slot")
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &PoolChunk)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_deref().map(|c| (id as ChunkId, c)))
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

pub(crate) struct ChunkList {
    min_usage: i64,
    max_usage: i64,
    /// `free_bytes` at or below this means the chunk's usage reached the
    /// band's upper bound and it belongs in the next list.
    free_min_threshold: usize,
    /// `free_bytes` above this means usage fell below the band's lower bound
    /// and the chunk migrates toward `prev`.
    free_max_threshold: usize,
    /// Largest normalized size any member chunk could possibly serve.
    max_capacity: usize,
    head: Option<ChunkId>,
}

impl ChunkList {
    fn new(min_usage: i64, max_usage: i64, chunk_size: usize) -> Self {
        assert!(min_usage <= max_usage);

        // Thresholds mirror the usage() rounding: `usage >= maxUsage` is
        // `freeBytes <= chunkSize*(100-maxUsage)/100`, corrected by
        // +0.99999999 for the floor division inside usage(). The float→int
        // cast saturates, so qInit's sentinel min_usage yields an
        // unreachable free_max_threshold.
        let free_min_threshold = if max_usage >= 100 {
            0
        } else {
            (chunk_size as f64 * (100.0 - max_usage as f64 + 0.99999999) / 100.0) as usize
        };
        let free_max_threshold = if min_usage >= 100 {
            0
        } else {
            (chunk_size as f64 * (100.0 - min_usage as f64 + 0.99999999) / 100.0) as usize
        };

        Self {
            min_usage,
            max_usage,
            free_min_threshold,
            free_max_threshold,
            max_capacity: Self::calculate_max_capacity(min_usage, chunk_size),
            head: None,
        }
    }

    /// A chunk at this list's minimum usage has `(100-minUsage)%` of its
    /// bytes free; nothing larger can ever be served from this list.
    fn calculate_max_capacity(min_usage: i64, chunk_size: usize) -> usize {
        let min_usage = min_usage.max(1);
        if min_usage >= 100 {
            return 0;
        }
        (chunk_size as u128 * (100 - min_usage) as u128 / 100) as usize
    }
}

pub(crate) struct ChunkLists {
    lists: [ChunkList; N_LISTS],
}

impl ChunkLists {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            lists: [
                ChunkList::new(i64::MIN, 25, chunk_size), // qInit
                ChunkList::new(1, 50, chunk_size),        // q000
                ChunkList::new(25, 75, chunk_size),       // q025
                ChunkList::new(50, 100, chunk_size),      // q050
                ChunkList::new(75, 100, chunk_size),      // q075
                ChunkList::new(100, i64::MAX, chunk_size), // q100
            ],
        }
    }

    /// Band lower bound as reported by metrics (at least 1).
    pub fn min_usage(&self, li: usize) -> u32 {
        self.lists[li].min_usage.clamp(1, 100) as u32
    }

    /// Band upper bound as reported by metrics (at most 100).
    pub fn max_usage(&self, li: usize) -> u32 {
        self.lists[li].max_usage.clamp(0, 100) as u32
    }

    /// Member chunk ids, head to tail.
    pub fn members(&self, storage: &ChunkStorage, li: usize) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let mut cur = self.lists[li].head;
        while let Some(id) = cur {
            out.push(id);
            cur = storage.get(id).next;
        }
        out
    }

    /// Try to carve `run_size` bytes out of a member chunk. The first chunk
    /// that fits wins; a cheap capacity check rejects the whole list when the
    /// normalized size cannot fit any member.
    pub fn allocate(
        &mut self,
        storage: &mut ChunkStorage,
        li: usize,
        norm_capacity: usize,
        run_size: usize,
        sc: &SizeClasses,
    ) -> Option<(ChunkId, Handle)> {
        if norm_capacity > self.lists[li].max_capacity {
            return None;
        }

        let mut cur = self.lists[li].head;
        while let Some(id) = cur {
            let chunk = storage.get_mut(id);
            let handle = chunk.allocate_run(run_size, sc);
            if !handle.is_none() {
                if chunk.free_bytes <= self.lists[li].free_min_threshold {
                    let next = NEXT_LIST[li].expect("allocation lists have a successor");
                    self.remove(storage, li, id);
                    self.add(storage, next, id);
                }
                return Some((id, handle));
            }
            cur = chunk.next;
        }
        None
    }

    /// Insert a chunk, forwarding toward higher-usage lists when it is
    /// already past this band.
    pub fn add(&mut self, storage: &mut ChunkStorage, li: usize, id: ChunkId) {
        if let Some(next) = NEXT_LIST[li] {
            if storage.get(id).free_bytes <= self.lists[li].free_min_threshold {
                return self.add(storage, next, id);
            }
        }
        self.add0(storage, li, id);
    }

    /// After a free inside a member chunk, migrate it down if its usage
    /// dropped out of the band. Returns false when the chunk fell off the
    /// chain and must be destroyed.
    pub fn free_migrate(&mut self, storage: &mut ChunkStorage, li: usize, id: ChunkId) -> bool {
        if storage.get(id).free_bytes > self.lists[li].free_max_threshold {
            self.remove(storage, li, id);
            return self.move_down(storage, PREV_LIST[li], id);
        }
        true
    }

    fn move_down(&mut self, storage: &mut ChunkStorage, prev: Option<usize>, id: ChunkId) -> bool {
        let Some(li) = prev else {
            debug_assert_eq!(storage.get(id).usage(), 0);
            return false;
        };
        self.move_into(storage, li, id)
    }

    fn move_into(&mut self, storage: &mut ChunkStorage, li: usize, id: ChunkId) -> bool {
        debug_assert!((storage.get(id).usage() as i64) < self.lists[li].max_usage);
        if storage.get(id).free_bytes > self.lists[li].free_max_threshold {
            return self.move_down(storage, PREV_LIST[li], id);
        }
        self.add0(storage, li, id);
        true
    }

    fn add0(&mut self, storage: &mut ChunkStorage, li: usize, id: ChunkId) {
        let old_head = self.lists[li].head;
        {
            let chunk = storage.get_mut(id);
            debug_assert_eq!(chunk.list, LIST_NONE);
            chunk.list = li as u8;
            chunk.prev = None;
            chunk.next = old_head;
        }
        if let Some(head) = old_head {
            storage.get_mut(head).prev = Some(id);
        }
        self.lists[li].head = Some(id);
    }

    pub fn remove(&mut self, storage: &mut ChunkStorage, li: usize, id: ChunkId) {
        let (prev, next) = {
            let chunk = storage.get_mut(id);
            debug_assert_eq!(chunk.list as usize, li);
            let links = (chunk.prev, chunk.next);
            chunk.list = LIST_NONE;
            chunk.prev = None;
            chunk.next = None;
            links
        };
        match prev {
            Some(p) => storage.get_mut(p).next = next,
            None => self.lists[li].head = next,
        }
        if let Some(n) = next {
            storage.get_mut(n).prev = prev;
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::region::{HEAP_PROVIDER, RegionProvider};

    const CHUNK_SIZE: usize = 4 * 1024 * 1024;

    fn classes() -> SizeClasses {
        SizeClasses::new(4096, 12, CHUNK_SIZE, 0)
    }

    fn new_chunk(storage: &mut ChunkStorage, sc: &SizeClasses) -> ChunkId {
        let region = HEAP_PROVIDER.allocate(sc.chunk_size(), 0).unwrap();
        storage.insert(Box::new(PoolChunk::new(region, sc)))
    }

    fn destroy_all(storage: &mut ChunkStorage) {
        let ids: Vec<ChunkId> = storage.iter().map(|(id, _)| id).collect();
        for id in ids {
            let chunk = storage.remove(id);
            HEAP_PROVIDER.release(chunk.region());
        }
    }

    #[test]
    fn test_thresholds() {
        let lists = ChunkLists::new(CHUNK_SIZE);
        // qInit never migrates down: unreachable threshold.
        assert_eq!(lists.lists[Q_INIT].free_max_threshold, usize::MAX);
        // q075 promotes to q100 only when completely full.
        assert_eq!(lists.lists[Q_075].free_min_threshold, 0);
        // q100 serves nothing.
        assert_eq!(lists.lists[Q_100].max_capacity, 0);
        // q000 drops a chunk only when its usage reaches 0.
        assert!(lists.lists[Q_000].free_max_threshold < CHUNK_SIZE);
        assert!(lists.lists[Q_000].free_max_threshold > CHUNK_SIZE * 99 / 100);
    }

    #[test]
    fn test_metric_bands() {
        let lists = ChunkLists::new(CHUNK_SIZE);
        assert_eq!(lists.min_usage(Q_INIT), 1);
        assert_eq!(lists.max_usage(Q_INIT), 25);
        assert_eq!(lists.min_usage(Q_000), 1);
        assert_eq!(lists.max_usage(Q_100), 100);
    }

    #[test]
    fn test_add_remove_linkage() {
        let sc = classes();
        let mut storage = ChunkStorage::new();
        let mut lists = ChunkLists::new(CHUNK_SIZE);

        let a = new_chunk(&mut storage, &sc);
        let b = new_chunk(&mut storage, &sc);
        let c = new_chunk(&mut storage, &sc);
        lists.add(&mut storage, Q_INIT, a);
        lists.add(&mut storage, Q_INIT, b);
        lists.add(&mut storage, Q_INIT, c);
        // Head insertion: newest first.
        assert_eq!(lists.members(&storage, Q_INIT), vec![c, b, a]);

        lists.remove(&mut storage, Q_INIT, b);
        assert_eq!(lists.members(&storage, Q_INIT), vec![c, a]);
        lists.remove(&mut storage, Q_INIT, c);
        assert_eq!(lists.members(&storage, Q_INIT), vec![a]);
        lists.remove(&mut storage, Q_INIT, a);
        assert!(lists.members(&storage, Q_INIT).is_empty());

        destroy_all(&mut storage);
    }

    #[test]
    fn test_half_used_chunk_migrates_and_drains_to_destruction() {
        let sc = classes();
        let mut storage = ChunkStorage::new();
        let mut lists = ChunkLists::new(CHUNK_SIZE);

        let id = new_chunk(&mut storage, &sc);
        lists.add(&mut storage, Q_INIT, id);

        // Using half the chunk pushes it past qInit's band; the allocate-path
        // migration forwards it (through q000's band check) into q025.
        let half = sc.chunk_size() / 2;
        let (got, handle) = lists
            .allocate(&mut storage, Q_INIT, half, half, &sc)
            .expect("half-chunk run");
        assert_eq!(got, id);
        assert_eq!(storage.get(id).list as usize, Q_025);
        assert_eq!(lists.members(&storage, Q_025), vec![id]);

        // Freeing drains usage to zero; the chunk migrates below q000 and
        // must be destroyed.
        storage.get_mut(id).free_run(handle, &sc);
        let keep = lists.free_migrate(&mut storage, Q_025, id);
        assert!(!keep);

        let chunk = storage.remove(id);
        HEAP_PROVIDER.release(chunk.region());
    }

    #[test]
    fn test_full_chunk_forwards_to_q100_on_add() {
        let sc = classes();
        let mut storage = ChunkStorage::new();
        let mut lists = ChunkLists::new(CHUNK_SIZE);

        let id = new_chunk(&mut storage, &sc);
        let handle = storage.get_mut(id).allocate_run(sc.chunk_size(), &sc);
        assert!(!handle.is_none());

        // A freshly created, already-full chunk entering at qInit cascades
        // all the way to q100.
        lists.add(&mut storage, Q_INIT, id);
        assert_eq!(storage.get(id).list as usize, Q_100);
        assert_eq!(lists.members(&storage, Q_100), vec![id]);

        storage.get_mut(id).free_run(handle, &sc);
        assert!(!lists.free_migrate(&mut storage, Q_100, id));
        destroy_all(&mut storage);
    }

    #[test]
    fn test_cheap_reject_by_max_capacity() {
        let sc = classes();
        let mut storage = ChunkStorage::new();
        let mut lists = ChunkLists::new(CHUNK_SIZE);

        // The full-chunk normalized size exceeds every list's max_capacity
        // (even an empty qInit member only advertises 99%), so the request is
        // rejected without touching any chunk.
        let id = new_chunk(&mut storage, &sc);
        lists.add(&mut storage, Q_INIT, id);
        for li in ALLOCATION_ORDER {
            assert!(
                lists
                    .allocate(&mut storage, li, sc.chunk_size(), sc.chunk_size(), &sc)
                    .is_none()
            );
        }
        assert_eq!(storage.get(id).free_bytes, sc.chunk_size());

        lists.remove(&mut storage, Q_INIT, id);
        destroy_all(&mut storage);
    }
}
