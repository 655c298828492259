//! Loom-based concurrency tests.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --lib --release`.
//!
//! Exercises the mutex-protected allocation paths and the relaxed counters
//! under every interleaving loom can explore.
//!
//! # Design notes
//!
//! - Thread counts kept to 2 (state space is exponential).
//! - One or two operations per thread.
//! - Arenas are built per iteration with a tiny chunk geometry; under
//!   cfg(loom) the region providers are plain `std::alloc` so no real pages
//!   move.
//! - The thread-cache registry is deliberately not exercised: it is
//!   thread-local and has no cross-thread interleavings for loom to explore;
//!   arena paths are driven with explicit no-cache calls.
#[cfg(loom)]
mod tests {
    use crate::pool::arena::{PoolArena, RawStorage};
    use crate::pool::region::HEAP_PROVIDER;
    use crate::pool::size_class::SizeClasses;
    use crate::sync::Arc;

    fn tiny_arena() -> Arc<PoolArena> {
        // 4 KiB pages, 64 KiB chunks: enough for two concurrent requests.
        Arc::new(PoolArena::new(
            SizeClasses::new(4096, 12, 64 * 1024, 0),
            &HEAP_PROVIDER,
        ))
    }

    fn alloc_free(arena: &PoolArena, size: usize) {
        let raw = arena.allocate(None, size).expect("allocation failed");
        let RawStorage::Pooled { chunk, handle } = raw.storage else {
            panic!("expected pooled storage");
        };
        arena.free_chunk(chunk, handle, raw.max_length);
    }

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::pool::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });
            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });
            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    #[test]
    fn loom_concurrent_normal_alloc_free() {
        bounded(2).check(|| {
            let arena = tiny_arena();
            let a = arena.clone();
            let b = arena.clone();

            // 16 KiB and 32 KiB are the Normal tier for this geometry
            // (subpage classes run up to 3.5 pages).
            let t1 = loom::thread::spawn(move || alloc_free(&a, 16 * 1024));
            let t2 = loom::thread::spawn(move || alloc_free(&b, 32 * 1024));
            t1.join().unwrap();
            t2.join().unwrap();

            let m = arena.metrics();
            assert_eq!(m.num_active_allocations(), 0);
        });
    }

    #[test]
    fn loom_concurrent_small_alloc_free() {
        bounded(2).check(|| {
            let arena = tiny_arena();
            let a = arena.clone();
            let b = arena.clone();

            // Both threads hit the same size class: the sentinel lock
            // serializes slot allocation, the arena lock run carving.
            let t1 = loom::thread::spawn(move || alloc_free(&a, 64));
            let t2 = loom::thread::spawn(move || alloc_free(&b, 64));
            t1.join().unwrap();
            t2.join().unwrap();

            let m = arena.metrics();
            assert_eq!(m.num_active_small_allocations(), 0);
        });
    }
}
