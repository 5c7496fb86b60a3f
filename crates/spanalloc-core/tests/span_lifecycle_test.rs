use spanalloc_core::{
    AllocError, Allocator, AllocatorConfig, FreeOutcome, MAX_SMALL_SIZE, PAGE_SIZE,
};

fn allocator(batch_size: usize) -> Allocator {
    Allocator::with_config(AllocatorConfig {
        batch_size,
        ..AllocatorConfig::default()
    })
}

#[test]
fn reallocating_freed_objects_reuses_reserved_pages() {
    let alloc = allocator(32);
    let first: Vec<usize> = (0..100).map(|_| alloc.malloc(256)).collect();
    let reserved = alloc.stats().host_reservations;
    for &addr in &first {
        alloc.free(addr);
    }
    let second: Vec<usize> = (0..100).map(|_| alloc.malloc(256)).collect();
    assert!(second.iter().all(|&addr| addr != 0));
    assert_eq!(alloc.stats().host_reservations, reserved);
    alloc.check_invariants().unwrap();
}

#[test]
fn reallocating_after_flush_reuses_reserved_pages() {
    let alloc = allocator(32);
    let first: Vec<usize> = (0..100).map(|_| alloc.malloc(256)).collect();
    let reserved = alloc.stats().host_reserved_bytes;
    for &addr in &first {
        alloc.free(addr);
    }
    alloc.flush_cache();
    assert_eq!(alloc.stats().spans_in_use, 0);

    for _ in 0..100 {
        assert_ne!(alloc.malloc(256), 0);
    }
    assert_eq!(alloc.stats().host_reserved_bytes, reserved);
}

#[test]
fn adjacent_spans_of_one_class_coalesce_on_reclaim() {
    // Two 2048-byte objects per batch fill exactly one page.
    let alloc = allocator(2);
    let objects: Vec<usize> = (0..4).map(|_| alloc.malloc(2048)).collect();
    assert_eq!(objects[2], objects[0] + PAGE_SIZE, "second span follows the first");
    assert_eq!(alloc.stats().spans_in_use, 2);

    for addr in objects {
        alloc.free(addr);
    }
    alloc.flush_cache();
    assert_eq!(alloc.free_span_page_counts(), vec![2]);
    assert_eq!(alloc.stats().spans_in_use, 0);
    alloc.check_invariants().unwrap();

    let logs = alloc.lifecycle_logs();
    assert_eq!(logs.iter().filter(|r| r.event == "span_reclaim").count(), 2);
    assert!(logs.iter().any(|r| r.event == "span_coalesce"));
}

#[test]
fn freed_large_spans_merge_with_both_neighbours() {
    let alloc = allocator(32);
    let a = alloc.malloc(10 * PAGE_SIZE);
    let b = alloc.malloc(12 * PAGE_SIZE);
    let c = alloc.malloc(14 * PAGE_SIZE);
    alloc.free(a);
    alloc.free(c);
    assert_eq!(alloc.free_span_page_counts(), vec![10, 14]);
    alloc.free(b);
    assert_eq!(alloc.free_span_page_counts(), vec![36]);

    // The merged span serves a request spanning all three.
    let d = alloc.malloc(36 * PAGE_SIZE);
    assert_eq!(d, a);
    assert_eq!(alloc.stats().host_reservations, 3);
}

#[test]
fn large_requests_bypass_cache_and_central_lists() {
    let alloc = allocator(32);
    let small = alloc.malloc(64);
    alloc.free(small);
    let before = alloc.stats();
    assert!(before.cache_bytes > 0);

    let big = alloc.malloc(MAX_SMALL_SIZE + 1);
    assert_ne!(big, 0);
    let after = alloc.stats();
    assert_eq!(after.cache_bytes, before.cache_bytes);
    assert_eq!(after.central_free_bytes, before.central_free_bytes);
    assert_eq!(after.cache_misses, before.cache_misses);

    alloc.free(big);
    let freed = alloc.stats();
    assert_eq!(freed.cache_bytes, before.cache_bytes);
    assert_eq!(freed.central_free_bytes, before.central_free_bytes);
}

#[test]
fn objects_on_interior_pages_free_cleanly() {
    // 20224-byte objects: 32 of them fill a 158-page span.
    let alloc = allocator(32);
    let objects: Vec<usize> = (0..8).map(|_| alloc.malloc(20_000)).collect();
    let base = objects[0];
    assert!(objects[7] - base > PAGE_SIZE);
    for addr in objects {
        assert_eq!(alloc.free(addr), FreeOutcome::Released);
    }
    alloc.check_invariants().unwrap();
}

#[test]
fn page_map_budget_surfaces_as_allocation_failure() {
    let alloc = Allocator::with_config(AllocatorConfig {
        page_map_node_limit: Some(1),
        ..AllocatorConfig::default()
    });
    assert!(matches!(
        alloc.try_malloc(64),
        Err(AllocError::PageMapExhausted { .. })
    ));
    assert_eq!(alloc.malloc(MAX_SMALL_SIZE * 4), 0);
    assert_eq!(alloc.stats().spans_in_use, 0);
}

#[test]
fn cache_shrinks_when_over_budget() {
    const SIZE: usize = 512;
    // Sixteen cached objects fit the budget; the seventeenth triggers a shrink.
    let alloc = Allocator::with_config(AllocatorConfig {
        cache_limit_bytes: 16 * SIZE,
        batch_size: 32,
        ..AllocatorConfig::default()
    });
    let mut live: Vec<usize> = (0..16).map(|_| alloc.malloc(SIZE)).collect();
    assert_eq!(alloc.stats().cache_bytes, 16 * SIZE);

    // First shrink: no low-water mark yet, so nothing drains; the mark
    // becomes 17.
    alloc.free(live.pop().unwrap());
    assert_eq!(alloc.stats().cache_bytes, 17 * SIZE);

    // Reusing four objects lowers the mark to 13.
    live.extend((0..4).map(|_| alloc.malloc(SIZE)));
    assert_eq!(alloc.stats().cache_bytes, 13 * SIZE);

    // The fourth free crosses the budget again and drains 13 / 2 = 6.
    for addr in live.drain(..4) {
        alloc.free(addr);
    }
    assert_eq!(alloc.stats().cache_bytes, 11 * SIZE);
    let shrink = alloc
        .lifecycle_logs()
        .into_iter()
        .rev()
        .find(|r| r.event == "cache_gc")
        .unwrap();
    assert_eq!(shrink.size, Some(6 * SIZE));

    alloc.free(live.pop().unwrap());
    assert_eq!(alloc.stats().cache_bytes, 12 * SIZE);
    alloc.check_invariants().unwrap();
}
