//! Central free lists.
//!
//! One list of carved spans per size class. Objects move between the cache
//! and these lists in batches; a span whose every object has come back is
//! returned to the page heap and coalesced.
//!
//! Span descriptors live in the page heap's arena, so every central
//! operation takes the central lock and then the heap lock.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::AllocError;
use crate::log::{AllocatorLogLevel, LogEvent, Telemetry};

use super::PAGE_SIZE;
use super::page_heap::PageHeap;
use super::size_class::{NUM_SIZE_CLASSES, class_to_size};
use super::span::{SpanId, SpanList, SpanState};

pub(crate) struct CentralState {
    /// Carved spans per size class, including fully handed-out ones.
    pub(crate) spans: Vec<SpanList>,
    /// Bytes of free objects held across all class lists.
    pub(crate) free_bytes: usize,
}

/// Central state and page heap locked together, in lock order.
pub(crate) struct CentralGuard<'a> {
    pub(crate) state: MutexGuard<'a, CentralState>,
    pub(crate) heap: MutexGuard<'a, PageHeap>,
}

pub struct CentralFreeList {
    state: Mutex<CentralState>,
    heap: Arc<Mutex<PageHeap>>,
    telemetry: Arc<Telemetry>,
}

impl CentralFreeList {
    pub(crate) fn new(heap: Arc<Mutex<PageHeap>>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            state: Mutex::new(CentralState {
                spans: vec![SpanList::new(); NUM_SIZE_CLASSES],
                free_bytes: 0,
            }),
            heap,
            telemetry,
        }
    }

    pub(crate) fn lock(&self) -> CentralGuard<'_> {
        let state = self.state.lock();
        let heap = self.heap.lock();
        CentralGuard { state, heap }
    }

    /// Bytes of free objects currently held by the central lists.
    pub fn free_bytes(&self) -> usize {
        self.state.lock().free_bytes
    }

    /// Moves up to `batch` free objects of `class` into `dest`.
    ///
    /// When no span of the class has a free object, one fresh span is carved
    /// and the pull is retried once. Returns the number of objects moved,
    /// which is at least one on success.
    pub(crate) fn get_objects(
        &self,
        class: usize,
        batch: usize,
        dest: &mut Vec<usize>,
    ) -> Result<usize, AllocError> {
        let mut guard = self.lock();
        let CentralGuard { state, heap } = &mut guard;

        let mut taken = take_from_spans(state, heap, class, batch, dest);
        if taken == 0 {
            self.fill(state, heap, class, batch)?;
            taken = take_from_spans(state, heap, class, batch, dest);
        }

        state.free_bytes -= taken * class_to_size(class);
        self.telemetry.set_central_free_bytes(state.free_bytes);
        Ok(taken)
    }

    /// Carves a fresh span large enough for one batch of `class`.
    fn fill(
        &self,
        state: &mut CentralState,
        heap: &mut PageHeap,
        class: usize,
        batch: usize,
    ) -> Result<(), AllocError> {
        let size = class_to_size(class);
        // At least one object must fit, whatever the batch size.
        let pages = (size.saturating_mul(batch) / PAGE_SIZE).max(size.div_ceil(PAGE_SIZE));
        let id = heap.get_span(pages)?;
        heap.carve(id, class)?;

        let span = &heap.spans()[id];
        let (start, objects) = (span.start, span.free_objects.len());
        state.spans[class].push(heap.spans_mut(), id);
        state.free_bytes += objects * size;

        self.telemetry.set_central_free_bytes(state.free_bytes);
        self.telemetry.record(
            AllocatorLogLevel::Debug,
            "central",
            "central_fill",
            "success",
            LogEvent {
                addr: Some(start),
                size: Some(size),
                class: Some(class),
                pages: Some(pages),
                details: format!("objects={objects}"),
            },
        );
        Ok(())
    }

    /// Returns one object of `class` to its span.
    #[cfg(test)]
    pub(crate) fn insert_object(&self, class: usize, addr: usize) {
        self.insert_objects(class, &[addr]);
    }

    /// Returns objects of `class` to their spans, reclaiming every span
    /// that becomes entirely free.
    ///
    /// # Panics
    ///
    /// If an object does not belong to a carved span of `class` that is
    /// linked into this class's list.
    pub(crate) fn insert_objects(&self, class: usize, objects: &[usize]) {
        if objects.is_empty() {
            return;
        }
        let size = class_to_size(class);
        let mut guard = self.lock();
        let CentralGuard { state, heap } = &mut guard;

        for &addr in objects {
            let id = self.owning_span(heap, class, addr);
            let span = &mut heap.spans_mut()[id];
            span.free_objects.push(addr);
            state.free_bytes += size;
            if span.free_objects.len() == span.capacity() {
                self.reclaim(state, heap, class, id);
            }
        }
        self.telemetry.set_central_free_bytes(state.free_bytes);
    }

    fn owning_span(&self, heap: &PageHeap, class: usize, addr: usize) -> SpanId {
        let found = heap.span_of(addr).filter(|&id| {
            let span = &heap.spans()[id];
            span.state == SpanState::AllocatedSmall && span.class == class && span.linked
        });
        match found {
            Some(id) => id,
            None => {
                self.telemetry.record(
                    AllocatorLogLevel::Error,
                    "central",
                    "span_not_found",
                    "invariant_violation",
                    LogEvent {
                        addr: Some(addr),
                        class: Some(class),
                        ..LogEvent::default()
                    },
                );
                panic!("span not found for object {addr:#x} of class {class}");
            }
        }
    }

    fn reclaim(&self, state: &mut CentralState, heap: &mut PageHeap, class: usize, id: SpanId) {
        let span = &heap.spans()[id];
        let (start, pages, capacity) = (span.start, span.pages, span.capacity());
        state.spans[class].remove(heap.spans_mut(), id);
        state.free_bytes -= capacity * class_to_size(class);
        heap.release_carved(id);

        self.telemetry.record(
            AllocatorLogLevel::Debug,
            "central",
            "span_reclaim",
            "success",
            LogEvent {
                addr: Some(start),
                class: Some(class),
                pages: Some(pages),
                details: format!("objects={capacity}"),
                ..LogEvent::default()
            },
        );
    }
}

fn take_from_spans(
    state: &CentralState,
    heap: &mut PageHeap,
    class: usize,
    batch: usize,
    dest: &mut Vec<usize>,
) -> usize {
    let mut taken = 0;
    for id in state.spans[class].ids(heap.spans()) {
        if taken == batch {
            break;
        }
        let free = &mut heap.spans_mut()[id].free_objects;
        let n = free.len().min(batch - taken);
        // Pop order keeps handing out ascending addresses.
        dest.extend(free.drain(free.len() - n..).rev());
        taken += n;
    }
    taken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SimulatedHost;
    use crate::malloc::size_class::size_to_class;

    fn central() -> CentralFreeList {
        let telemetry = Arc::new(Telemetry::new(AllocatorLogLevel::Trace, 256));
        let heap = PageHeap::new(Box::new(SimulatedHost::new()), None, Arc::clone(&telemetry));
        CentralFreeList::new(Arc::new(Mutex::new(heap)), telemetry)
    }

    #[test]
    fn test_get_objects_fills_one_batch() {
        let central = central();
        let class = size_to_class(128);
        let mut objects = Vec::new();
        let n = central.get_objects(class, 32, &mut objects).unwrap();
        assert_eq!(n, 32);
        assert_eq!(objects.len(), 32);
        // 128 * 32 bytes is exactly one page, fully handed out.
        assert_eq!(central.free_bytes(), 0);
        assert!(objects.windows(2).all(|w| w[1] == w[0] + 128));
    }

    #[test]
    fn test_get_objects_returns_partial_batch_before_refill() {
        let central = central();
        let class = size_to_class(3072);
        let mut objects = Vec::new();
        // 3072 * 32 / 4096 = 24 pages, which hold 32 objects exactly.
        assert_eq!(central.get_objects(class, 32, &mut objects).unwrap(), 32);
        central.insert_object(class, objects.pop().unwrap());
        assert_eq!(central.free_bytes(), 3072);

        let mut more = Vec::new();
        assert_eq!(central.get_objects(class, 32, &mut more).unwrap(), 1);
        assert_eq!(central.free_bytes(), 0);
    }

    #[test]
    fn test_large_class_with_tiny_batch_still_gets_an_object() {
        let central = central();
        let class = size_to_class(32768);
        let mut objects = Vec::new();
        assert_eq!(central.get_objects(class, 1, &mut objects).unwrap(), 1);
    }

    #[test]
    fn test_fully_freed_span_is_reclaimed() {
        let central = central();
        let class = size_to_class(64);
        let mut objects = Vec::new();
        central.get_objects(class, 64, &mut objects).unwrap();
        central.insert_objects(class, &objects);

        let guard = central.lock();
        assert!(guard.state.spans[class].is_empty());
        assert_eq!(guard.state.free_bytes, 0);
        assert_eq!(guard.heap.free_span_page_counts(), vec![1]);
        drop(guard);

        let logs = central.telemetry.records();
        assert!(logs.iter().any(|r| r.event == "span_reclaim"));
    }

    #[test]
    #[should_panic(expected = "span not found")]
    fn test_insert_foreign_object_panics() {
        let central = central();
        let class = size_to_class(64);
        let mut objects = Vec::new();
        central.get_objects(class, 1, &mut objects).unwrap();
        central.insert_object(size_to_class(128), objects[0]);
    }
}
