//! Page heap: the top-level span arena.
//!
//! Free spans are filed by page count. Bucket `i` holds spans of exactly
//! `i + 1` pages, except the last bucket which holds every span of
//! [`PAGE_HEAP_BUCKETS`] pages or more. A request is served from the exact
//! bucket, by splitting a larger free span, or by reserving fresh pages from
//! the host, in that order.

use std::sync::Arc;

use crate::error::{AllocError, InvariantViolation};
use crate::host::HostMemory;
use crate::log::{AllocatorLogLevel, LogEvent, Telemetry};

use super::PAGE_SIZE;
use super::page_map::PageMap;
use super::span::{Span, SpanArena, SpanId, SpanList, SpanState};

/// Number of free-span buckets; the last one is the catch-all.
pub const PAGE_HEAP_BUCKETS: usize = 256;

fn bucket_for(pages: usize) -> usize {
    pages.min(PAGE_HEAP_BUCKETS) - 1
}

pub struct PageHeap {
    spans: SpanArena,
    page_map: PageMap,
    free_lists: Vec<SpanList>,
    host: Box<dyn HostMemory>,
    telemetry: Arc<Telemetry>,
}

impl PageHeap {
    pub(crate) fn new(
        host: Box<dyn HostMemory>,
        page_map_node_limit: Option<usize>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            spans: SpanArena::new(),
            page_map: PageMap::new(page_map_node_limit),
            free_lists: vec![SpanList::new(); PAGE_HEAP_BUCKETS],
            host,
            telemetry,
        }
    }

    pub fn spans(&self) -> &SpanArena {
        &self.spans
    }

    pub(crate) fn spans_mut(&mut self) -> &mut SpanArena {
        &mut self.spans
    }

    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    pub fn host_reserved_bytes(&self) -> usize {
        self.host.reserved_bytes()
    }

    pub fn host_reservations(&self) -> usize {
        self.host.reservations()
    }

    /// Span whose page-map entry covers `addr` and whose range contains it.
    pub fn span_of(&self, addr: usize) -> Option<SpanId> {
        self.page_map
            .get(addr / PAGE_SIZE)
            .filter(|&id| self.spans[id].contains(addr))
    }

    /// Takes a free span of exactly `pages` pages out of the heap.
    ///
    /// The returned span is still `Free` and still mapped at its boundary
    /// pages; the caller assigns its new state.
    pub fn get_span(&mut self, pages: usize) -> Result<SpanId, AllocError> {
        if pages == 0 {
            return Err(AllocError::InvalidPageCount { pages });
        }
        loop {
            if let Some(id) = self.take_exact(pages) {
                return Ok(id);
            }
            // fill always files a span of exactly `pages`, so the retry hits.
            self.fill(pages)?;
        }
    }

    fn take_exact(&mut self, pages: usize) -> Option<SpanId> {
        let bucket = bucket_for(pages);
        if pages < PAGE_HEAP_BUCKETS {
            return self.free_lists[bucket].pop(&mut self.spans);
        }
        let id = self.free_lists[bucket].find(&self.spans, |span| span.pages == pages)?;
        self.free_lists[bucket].remove(&mut self.spans, id);
        Some(id)
    }

    /// Makes a free span of exactly `pages` pages available.
    fn fill(&mut self, pages: usize) -> Result<(), AllocError> {
        for bucket in pages..PAGE_HEAP_BUCKETS {
            if let Some(id) = self.free_lists[bucket].pop(&mut self.spans) {
                return self.split_and_insert(id, pages);
            }
        }

        let catch_all = PAGE_HEAP_BUCKETS - 1;
        if let Some(id) = self.free_lists[catch_all].find(&self.spans, |span| span.pages > pages) {
            self.free_lists[catch_all].remove(&mut self.spans, id);
            return self.split_and_insert(id, pages);
        }

        let bytes = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(AllocError::InvalidPageCount { pages })?;
        let start = self
            .host
            .reserve(bytes)
            .ok_or(AllocError::HostExhausted { bytes })?;
        self.telemetry
            .set_host_reserved_bytes(self.host.reserved_bytes());
        self.telemetry.record(
            AllocatorLogLevel::Info,
            "page_heap",
            "host_reserve",
            "success",
            LogEvent {
                addr: Some(start),
                size: Some(bytes),
                pages: Some(pages),
                ..LogEvent::default()
            },
        );

        let id = self.spans.insert(Span::new(start, pages));
        if let Err(err) = self.insert_span(id) {
            self.spans.remove(id);
            self.telemetry.record(
                AllocatorLogLevel::Warn,
                "page_heap",
                "host_reserve",
                err.outcome(),
                LogEvent {
                    addr: Some(start),
                    pages: Some(pages),
                    details: "reserved pages could not be mapped and are abandoned".into(),
                    ..LogEvent::default()
                },
            );
            return Err(err);
        }
        Ok(())
    }

    fn split_and_insert(&mut self, id: SpanId, pages: usize) -> Result<(), AllocError> {
        match self.split(id, pages) {
            Ok(tail) => {
                self.insert_span(id)?;
                self.insert_span(tail)
            }
            Err(err) => {
                self.insert_span(id)?;
                Err(err)
            }
        }
    }

    /// Cuts the trailing `pages` pages of an unlinked span into a new span.
    ///
    /// Both pieces are left mapped at their boundaries and unlinked. Fails
    /// before touching anything if the page map cannot cover the new
    /// boundary pages.
    pub(crate) fn split(&mut self, id: SpanId, pages: usize) -> Result<SpanId, AllocError> {
        let (start, total) = {
            let span = &self.spans[id];
            (span.start, span.pages)
        };
        assert!(total > pages, "cannot split {pages} pages off a {total}-page span");
        let first = start / PAGE_SIZE;
        let keep = total - pages;
        self.page_map.reserve_page(first + keep - 1)?;
        self.page_map.reserve_page(first + keep)?;

        self.page_map.remove_span(first, total);
        self.spans[id].pages = keep;
        self.page_map.insert_span(first, keep, id)?;

        let tail = self.spans.insert(Span::new(start + keep * PAGE_SIZE, pages));
        self.page_map.insert_span(first + keep, pages, tail)?;

        self.telemetry.record(
            AllocatorLogLevel::Debug,
            "page_heap",
            "span_split",
            "success",
            LogEvent {
                addr: Some(start),
                pages: Some(pages),
                details: format!("kept={keep}"),
                ..LogEvent::default()
            },
        );
        Ok(tail)
    }

    /// Merges an unlinked span with its free page-adjacent neighbours.
    ///
    /// Both sides are merged in the same call. The span's own page-map
    /// entries are removed and not restored; [`PageHeap::insert_span`]
    /// records the merged boundaries.
    pub(crate) fn coalesce(&mut self, id: SpanId) {
        let (first, pages) = {
            let span = &self.spans[id];
            (span.first_page(), span.pages)
        };
        self.page_map.remove_span(first, pages);

        let mut absorbed = 0;
        if let Some(prev) = first
            .checked_sub(1)
            .and_then(|page| self.free_neighbour(id, page))
        {
            let before = self.detach(prev);
            let span = &mut self.spans[id];
            span.start = before.start;
            span.pages += before.pages;
            absorbed += before.pages;
        }
        if let Some(next) = self.free_neighbour(id, first + pages) {
            let after = self.detach(next);
            self.spans[id].pages += after.pages;
            absorbed += after.pages;
        }

        if absorbed > 0 {
            let span = &self.spans[id];
            let (start, merged) = (span.start, span.pages);
            self.telemetry.record(
                AllocatorLogLevel::Debug,
                "page_heap",
                "span_coalesce",
                "success",
                LogEvent {
                    addr: Some(start),
                    pages: Some(merged),
                    details: format!("absorbed={absorbed}"),
                    ..LogEvent::default()
                },
            );
        }
    }

    fn free_neighbour(&self, id: SpanId, page: usize) -> Option<SpanId> {
        self.page_map
            .get(page)
            .filter(|&other| other != id && self.spans[other].state == SpanState::Free)
    }

    /// Unmaps, unlinks, and discards a free span, returning its descriptor.
    fn detach(&mut self, id: SpanId) -> Span {
        let (first, pages) = {
            let span = &self.spans[id];
            (span.first_page(), span.pages)
        };
        self.page_map.remove_span(first, pages);
        self.free_lists[bucket_for(pages)].remove(&mut self.spans, id);
        self.spans.remove(id)
    }

    /// Maps a span at its boundaries, resets it to `Free`, and files it.
    pub(crate) fn insert_span(&mut self, id: SpanId) -> Result<(), AllocError> {
        let (first, pages) = {
            let span = &self.spans[id];
            (span.first_page(), span.pages)
        };
        self.page_map.insert_span(first, pages, id)?;
        self.spans[id].reset();
        self.free_lists[bucket_for(pages)].push(&mut self.spans, id);
        Ok(())
    }

    /// Coalesces a span that left circulation and files it as free.
    pub(crate) fn release_span(&mut self, id: SpanId) {
        self.coalesce(id);
        // Merged boundaries were mapped before, so no page-map node is needed.
        self.insert_span(id)
            .expect("boundary pages of a coalesced span are already mapped");
    }

    /// Carves a span taken by [`PageHeap::get_span`] into objects of `class`
    /// and maps every page of it.
    pub(crate) fn carve(&mut self, id: SpanId, class: usize) -> Result<(), AllocError> {
        let (first, pages) = {
            let span = &self.spans[id];
            (span.first_page(), span.pages)
        };
        if let Err(err) = self.page_map.insert_range(first, pages, id) {
            self.insert_span(id)?;
            return Err(err);
        }
        self.spans[id].make_objects(class);
        Ok(())
    }

    /// Returns a fully free carved span to the heap.
    pub(crate) fn release_carved(&mut self, id: SpanId) {
        let (first, pages) = {
            let span = &self.spans[id];
            (span.first_page(), span.pages)
        };
        self.page_map.remove_range(first, pages);
        self.spans[id].reset();
        self.release_span(id);
    }

    /// Hands out a whole span for a large request and returns its start.
    pub(crate) fn allocate_large(&mut self, pages: usize) -> Result<usize, AllocError> {
        let id = self.get_span(pages)?;
        let span = &mut self.spans[id];
        span.state = SpanState::AllocatedLarge;
        Ok(span.start)
    }

    /// Page counts of every free span, smallest first.
    pub fn free_span_page_counts(&self) -> Vec<usize> {
        let mut counts: Vec<usize> = self
            .free_lists
            .iter()
            .flat_map(|list| list.ids(&self.spans))
            .map(|id| self.spans[id].pages)
            .collect();
        counts.sort_unstable();
        counts
    }

    pub fn free_pages(&self) -> usize {
        self.free_span_page_counts().iter().sum()
    }

    /// Verifies bucket filing, page-map boundaries, and span disjointness.
    pub(crate) fn check(&self) -> Result<(), InvariantViolation> {
        let mut filed = 0;
        for (bucket, list) in self.free_lists.iter().enumerate() {
            for id in list.ids(&self.spans) {
                let span = &self.spans[id];
                if span.state != SpanState::Free || bucket_for(span.pages) != bucket {
                    return Err(InvariantViolation::MisfiledSpan {
                        start: span.start,
                        pages: span.pages,
                        bucket,
                    });
                }
                filed += 1;
            }
        }

        let mut ranges = Vec::with_capacity(self.spans.len());
        let mut free = 0;
        for (id, span) in self.spans.iter() {
            if !span.is_consistent() {
                return Err(InvariantViolation::Inconsistent { start: span.start });
            }
            if self.page_map.get(span.first_page()) != Some(id)
                || self.page_map.get(span.last_page()) != Some(id)
            {
                return Err(InvariantViolation::Unmapped { start: span.start });
            }
            if span.state == SpanState::Free {
                free += 1;
                if !span.linked {
                    return Err(InvariantViolation::UnfiledSpan { start: span.start });
                }
            }
            ranges.push((span.start, span.end()));
        }
        debug_assert_eq!(free, filed);

        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(InvariantViolation::Overlap {
                    first: pair[0].0,
                    second: pair[1].0,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SimulatedHost;
    use crate::malloc::page_map::LEVEL_BITS;
    use crate::malloc::size_class::size_to_class;

    fn heap() -> PageHeap {
        heap_with(SimulatedHost::new(), None)
    }

    fn heap_with(host: SimulatedHost, node_limit: Option<usize>) -> PageHeap {
        let telemetry = Arc::new(Telemetry::new(AllocatorLogLevel::Trace, 256));
        PageHeap::new(Box::new(host), node_limit, telemetry)
    }

    #[test]
    fn test_get_span_reserves_fresh_pages() {
        let mut heap = heap();
        let id = heap.get_span(3).unwrap();
        let span = &heap.spans()[id];
        assert_eq!(span.pages, 3);
        assert_eq!(span.state, SpanState::Free);
        assert!(!span.linked);
        assert_eq!(heap.host_reserved_bytes(), 3 * PAGE_SIZE);
        assert_eq!(heap.host_reservations(), 1);
    }

    #[test]
    fn test_get_span_zero_pages_is_invalid() {
        let mut heap = heap();
        assert_eq!(
            heap.get_span(0).unwrap_err(),
            AllocError::InvalidPageCount { pages: 0 }
        );
    }

    #[test]
    fn test_get_span_splits_larger_free_span() {
        let mut heap = heap();
        let big = heap.get_span(10).unwrap();
        heap.insert_span(big).unwrap();

        let small = heap.get_span(4).unwrap();
        assert_eq!(heap.spans()[small].pages, 4);
        // The split-off piece is the tail of the original span.
        assert_eq!(heap.spans()[small].start, heap.spans()[big].start + 6 * PAGE_SIZE);
        assert_eq!(heap.free_span_page_counts(), vec![6]);
        assert_eq!(heap.host_reservations(), 1);
        heap.spans_mut()[small].state = SpanState::AllocatedLarge;
        heap.check().unwrap();
    }

    #[test]
    fn test_catch_all_bucket_serves_exact_and_split() {
        let mut heap = heap();
        let huge = heap.get_span(300).unwrap();
        heap.insert_span(huge).unwrap();
        assert_eq!(heap.free_span_page_counts(), vec![300]);

        let exact = heap.get_span(300).unwrap();
        assert_eq!(exact, huge);
        heap.insert_span(exact).unwrap();

        let part = heap.get_span(260).unwrap();
        assert_eq!(heap.spans()[part].pages, 260);
        assert_eq!(heap.free_span_page_counts(), vec![40]);
        assert_eq!(heap.host_reservations(), 1);
    }

    #[test]
    fn test_host_exhaustion_propagates() {
        let mut heap = heap_with(SimulatedHost::with_limit(2 * PAGE_SIZE), None);
        heap.get_span(2).unwrap();
        assert_eq!(
            heap.get_span(1).unwrap_err(),
            AllocError::HostExhausted { bytes: PAGE_SIZE }
        );
    }

    #[test]
    fn test_coalesce_merges_both_neighbours() {
        let mut heap = heap();
        let a = heap.get_span(1).unwrap();
        let b = heap.get_span(2).unwrap();
        let c = heap.get_span(3).unwrap();
        let start = heap.spans()[a].start;
        assert_eq!(heap.spans()[b].start, start + PAGE_SIZE);
        assert_eq!(heap.spans()[c].start, start + 3 * PAGE_SIZE);

        heap.insert_span(a).unwrap();
        heap.insert_span(c).unwrap();
        heap.release_span(b);

        assert_eq!(heap.free_span_page_counts(), vec![6]);
        assert_eq!(heap.spans()[b].start, start);
        assert_eq!(heap.spans().len(), 1);
        assert_eq!(heap.span_of(start + 5 * PAGE_SIZE + 8), Some(b));
        assert_eq!(heap.span_of(start + 2 * PAGE_SIZE), None);
        heap.check().unwrap();
    }

    #[test]
    fn test_coalesce_skips_allocated_neighbours() {
        let mut heap = heap();
        let a = heap.get_span(1).unwrap();
        let b = heap.get_span(1).unwrap();
        heap.spans_mut()[a].state = SpanState::AllocatedLarge;
        heap.release_span(b);
        assert_eq!(heap.free_span_page_counts(), vec![1]);
        assert_eq!(heap.spans()[a].state, SpanState::AllocatedLarge);
    }

    #[test]
    fn test_carve_maps_every_page() {
        let mut heap = heap();
        let id = heap.get_span(4).unwrap();
        heap.carve(id, size_to_class(2048)).unwrap();
        let start = heap.spans()[id].start;
        for page in 0..4 {
            assert_eq!(heap.span_of(start + page * PAGE_SIZE + 16), Some(id));
        }
        assert_eq!(heap.spans()[id].free_objects.len(), 8);

        heap.release_carved(id);
        assert_eq!(heap.span_of(start + PAGE_SIZE), None);
        assert_eq!(heap.span_of(start), Some(id));
        assert_eq!(heap.spans()[id].state, SpanState::Free);
    }

    #[test]
    fn test_split_fails_cleanly_when_page_map_is_full() {
        let leaf_pages = 1 << LEVEL_BITS;
        // Interior node plus the leaves holding the first and last page.
        let mut heap = heap_with(SimulatedHost::new(), Some(3));
        let big = heap.get_span(3 * leaf_pages).unwrap();
        heap.insert_span(big).unwrap();
        assert_eq!(heap.page_map().node_count(), 3);

        // The cut lands in two leaves that do not exist yet.
        let err = heap.get_span(leaf_pages).unwrap_err();
        assert!(matches!(err, AllocError::PageMapExhausted { .. }));
        assert_eq!(heap.free_span_page_counts(), vec![3 * leaf_pages]);
        assert_eq!(heap.host_reservations(), 1);
        heap.check().unwrap();
    }

    #[test]
    fn test_allocate_large_marks_span() {
        let mut heap = heap();
        let start = heap.allocate_large(5).unwrap();
        let id = heap.span_of(start).unwrap();
        assert_eq!(heap.spans()[id].state, SpanState::AllocatedLarge);
        assert_eq!(heap.spans()[id].pages, 5);
    }

    #[test]
    fn test_host_reserve_is_logged() {
        let mut heap = heap();
        heap.get_span(2).unwrap();
        let logs = heap.telemetry.records();
        assert!(logs.iter().any(|r| r.event == "host_reserve" && r.pages == Some(2)));
    }
}
