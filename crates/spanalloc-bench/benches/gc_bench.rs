//! Collector benchmarks: both mark strategies over the same object graphs.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use spanalloc_bench::push_tree;
use spanalloc_core::{Allocator, AllocatorConfig, AllocatorLogLevel};
use spanalloc_gc::{MarkStrategy, MarkSweepVm, TriColorVm, Vm, VmConfig};

fn allocator() -> Arc<Allocator> {
    Arc::new(Allocator::with_config(AllocatorConfig {
        log_level: AllocatorLogLevel::Error,
        ..AllocatorConfig::default()
    }))
}

fn config() -> VmConfig {
    VmConfig {
        stack_capacity: 1024,
        initial_threshold: 1 << 16,
        ..VmConfig::default()
    }
}

fn live_tree_collection<M: MarkStrategy>(vm: &mut Vm<M>) {
    // Everything stays rooted, so each collection marks the whole tree.
    let report = vm.gc();
    criterion::black_box(report);
}

fn bench_mark_live_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("mark_live_tree");
    for depth in [6_u32, 10] {
        let mut ms = MarkSweepVm::with_config(allocator(), config());
        push_tree(&mut ms, depth).expect("tree fits");
        group.bench_with_input(BenchmarkId::new("mark_sweep", depth), &depth, |b, _| {
            b.iter(|| live_tree_collection(&mut ms));
        });

        let mut tc = TriColorVm::with_config(allocator(), config());
        push_tree(&mut tc, depth).expect("tree fits");
        group.bench_with_input(BenchmarkId::new("tri_color", depth), &depth, |b, _| {
            b.iter(|| live_tree_collection(&mut tc));
        });
    }
    group.finish();
}

fn bench_build_and_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_and_free");
    let alloc = allocator();
    group.bench_function("mark_sweep_depth8", |b| {
        b.iter(|| {
            let mut vm = MarkSweepVm::with_config(Arc::clone(&alloc), VmConfig::default());
            push_tree(&mut vm, 8).expect("tree fits");
            criterion::black_box(vm.free());
        });
    });
    group.bench_function("tri_color_depth8", |b| {
        b.iter(|| {
            let mut vm = TriColorVm::with_config(Arc::clone(&alloc), VmConfig::default());
            push_tree(&mut vm, 8).expect("tree fits");
            criterion::black_box(vm.free());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_mark_live_tree, bench_build_and_free);
criterion_main!(benches);
