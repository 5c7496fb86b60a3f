//! Allocator benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use spanalloc_bench::mixed_sizes;
use spanalloc_core::{Allocator, AllocatorConfig, AllocatorLogLevel};

fn quiet_allocator() -> Allocator {
    Allocator::with_config(AllocatorConfig {
        log_level: AllocatorLogLevel::Error,
        ..AllocatorConfig::default()
    })
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768, 131072];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        let alloc = quiet_allocator();
        group.bench_with_input(BenchmarkId::new("spanalloc", size), &size, |b, &sz| {
            b.iter(|| {
                let addr = alloc.malloc(sz);
                alloc.free(criterion::black_box(addr));
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("1000x64B", |b| {
        let alloc = quiet_allocator();
        b.iter(|| {
            let addrs: Vec<usize> = (0..1000).map(|_| alloc.malloc(64)).collect();
            for addr in criterion::black_box(addrs) {
                alloc.free(addr);
            }
        });
    });

    group.bench_function("mixed_sizes", |b| {
        let alloc = quiet_allocator();
        let sizes = mixed_sizes(42, 512);
        b.iter(|| {
            let addrs: Vec<usize> = sizes.iter().map(|&size| alloc.malloc(size)).collect();
            for addr in criterion::black_box(addrs) {
                alloc.free(addr);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst);
criterion_main!(benches);
