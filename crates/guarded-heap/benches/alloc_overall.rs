//! Benchmark: allocation and free throughput across the two paths.
//!
//! Traces dominate the safety overhead, so each case runs with and
//! without capture to show the split.

use criterion::{criterion_group, criterion_main, Criterion};
use guarded_heap::{Config, GuardedHeap};
use std::hint::black_box;

fn bench_small_alloc_free(c: &mut Criterion) {
    let heap = GuardedHeap::new(Config::default());
    c.bench_function("small_alloc_free_64", |b| {
        b.iter(|| {
            let ptr = heap.allocate(black_box(64), 3, 0).expect("out of memory");
            unsafe { heap.free(ptr, 64, 3, 0) };
        });
    });
    drop(heap);

    let heap = GuardedHeap::new(Config {
        stack_trace_frames: 0,
        ..Config::default()
    });
    c.bench_function("small_alloc_free_64_no_traces", |b| {
        b.iter(|| {
            let ptr = heap.allocate(black_box(64), 3, 0).expect("out of memory");
            unsafe { heap.free(ptr, 64, 3, 0) };
        });
    });
    drop(heap);
}

fn bench_small_batches(c: &mut Criterion) {
    let heap = GuardedHeap::new(Config {
        stack_trace_frames: 0,
        ..Config::default()
    });
    c.bench_function("small_batch_256x32", |b| {
        b.iter(|| {
            let ptrs: Vec<_> = (0..256)
                .map(|_| heap.allocate(32, 0, 0).expect("out of memory"))
                .collect();
            black_box(&ptrs);
            for ptr in ptrs {
                unsafe { heap.free(ptr, 32, 0, 0) };
            }
        });
    });
    drop(heap);
}

fn bench_large_alloc_free(c: &mut Criterion) {
    let page_size = sys_pages::page_size();
    let heap = GuardedHeap::new(Config {
        stack_trace_frames: 0,
        ..Config::default()
    });
    c.bench_function("large_alloc_free_4_pages", |b| {
        b.iter(|| {
            let len = black_box(page_size * 4);
            let ptr = heap.allocate(len, 0, 0).expect("out of memory");
            unsafe { heap.free(ptr, len, 0, 0) };
        });
    });
    drop(heap);
}

criterion_group!(
    benches,
    bench_small_alloc_free,
    bench_small_batches,
    bench_large_alloc_free
);
criterion_main!(benches);
