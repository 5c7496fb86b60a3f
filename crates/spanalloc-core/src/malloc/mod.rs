//! Memory allocation.
//!
//! A multi-tier allocator over host-reserved pages:
//! - Small allocations (<=32KB): size-class objects carved from spans, served
//!   through a magazine cache backed by central free lists
//! - Large allocations (>32KB): whole spans taken from the page heap

pub mod allocator;
pub mod central;
pub mod page_heap;
pub mod page_map;
pub mod size_class;
pub mod span;
pub mod thread_cache;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;
/// Bytes per page.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub use allocator::{Allocator, AllocatorStats, FreeOutcome};
pub use central::CentralFreeList;
pub use page_heap::{PAGE_HEAP_BUCKETS, PageHeap};
pub use page_map::PageMap;
pub use size_class::{MAX_SMALL_SIZE, NUM_SIZE_CLASSES, class_to_size, size_to_class};
pub use span::{Span, SpanId, SpanState};
pub use thread_cache::ThreadCache;
