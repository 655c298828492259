use std::hint::black_box;

use bytepool::PooledAllocator;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn bench_alloc_free(c: &mut Criterion) {
    let alloc = PooledAllocator::new().unwrap();
    let mut group = c.benchmark_group("alloc_free");

    for size in [64usize, 1024, 8192, 64 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut buf = alloc.heap_buffer(black_box(size)).unwrap();
                buf.as_mut_slice()[0] = 1;
                black_box(&buf);
            });
        });
    }
    group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
    let alloc = PooledAllocator::new().unwrap();
    c.bench_function("realloc_1k_to_64k", |b| {
        b.iter(|| {
            let mut buf = alloc.heap_buffer(black_box(1024)).unwrap();
            alloc.reallocate(&mut buf, 64 * 1024, true).unwrap();
            black_box(&buf);
        });
    });
}

criterion_group!(benches, bench_alloc_free, bench_realloc_growth);
criterion_main!(benches);
