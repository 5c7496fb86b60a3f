//! Allocator facade.
//!
//! Routes small requests through the cache and large requests straight to
//! the page heap, and routes frees back by rediscovering the owning span
//! through the page map.
//!
//! Lock order is cache, central, heap, live set. No path takes an earlier
//! lock while holding a later one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AllocatorConfig;
use crate::error::{AllocError, InvariantViolation};
use crate::host::{HostMemory, SimulatedHost};
use crate::log::{self, AllocatorLogLevel, AllocatorLogRecord, LogEvent, Telemetry};

use super::PAGE_SIZE;
use super::central::CentralFreeList;
use super::page_heap::PageHeap;
use super::size_class::{MAX_SMALL_SIZE, class_to_size, size_to_class};
use super::span::{SpanId, SpanState};
use super::thread_cache::ThreadCache;

/// Tracks an outstanding allocation.
#[derive(Debug, Clone, Copy)]
struct AllocationRecord {
    /// Size requested by the caller.
    user_size: usize,
    /// Size class, or `None` for a large allocation.
    class: Option<usize>,
}

/// Result of a free operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The allocation went back to the cache or the page heap.
    Released,
    /// Address 0; nothing to do.
    Null,
    /// The address does not start any outstanding allocation.
    Unowned,
    /// The address lies in a span that is already free.
    AlreadyFree,
}

/// Point-in-time allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub live_objects: usize,
    /// Bytes requested by callers for outstanding allocations.
    pub live_bytes: usize,
    pub cache_bytes: usize,
    pub central_free_bytes: usize,
    /// Pages held in free spans of the page heap.
    pub free_pages: usize,
    /// Spans that are carved or allocated whole.
    pub spans_in_use: usize,
    pub host_reserved_bytes: usize,
    pub host_reservations: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// The allocator context: one page heap, one set of central lists, and one
/// cache, shared by every caller.
pub struct Allocator {
    cache: Mutex<ThreadCache>,
    central: Arc<CentralFreeList>,
    heap: Arc<Mutex<PageHeap>>,
    live: Mutex<HashMap<usize, AllocationRecord>>,
    telemetry: Arc<Telemetry>,
    config: AllocatorConfig,
}

impl Allocator {
    /// Creates an allocator with default tuning over a fresh simulated host.
    pub fn new() -> Self {
        Self::with_config(AllocatorConfig::default())
    }

    /// Creates an allocator tuned from `SPANALLOC_*` environment variables.
    pub fn from_env() -> Self {
        Self::with_config(AllocatorConfig::from_env())
    }

    /// Creates an allocator over a simulated host capped at
    /// `config.host_limit_bytes`.
    pub fn with_config(config: AllocatorConfig) -> Self {
        let host = match config.host_limit_bytes {
            Some(limit) => SimulatedHost::with_limit(limit),
            None => SimulatedHost::new(),
        };
        Self::with_host(config, Box::new(host))
    }

    /// Creates an allocator over a caller-supplied host.
    pub fn with_host(config: AllocatorConfig, host: Box<dyn HostMemory>) -> Self {
        let telemetry = Arc::new(Telemetry::new(config.log_level, config.log_capacity));
        let heap = Arc::new(Mutex::new(PageHeap::new(
            host,
            config.page_map_node_limit,
            Arc::clone(&telemetry),
        )));
        let central = Arc::new(CentralFreeList::new(
            Arc::clone(&heap),
            Arc::clone(&telemetry),
        ));
        let cache = ThreadCache::new(
            Arc::clone(&central),
            config.batch_size,
            config.cache_limit_bytes,
            Arc::clone(&telemetry),
        );
        Self {
            cache: Mutex::new(cache),
            central,
            heap,
            live: Mutex::new(HashMap::new()),
            telemetry,
            config,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocates `size` bytes, returning 0 on failure or for a zero size.
    pub fn malloc(&self, size: usize) -> usize {
        self.try_malloc(size).unwrap_or(0)
    }

    /// Allocates `size` bytes, surfacing the reason for a failure.
    ///
    /// A zero size yields `Ok(0)` without touching any tier.
    pub fn try_malloc(&self, size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Ok(0);
        }
        let result = if size <= MAX_SMALL_SIZE {
            let class = size_to_class(size);
            let mut cache = self.cache.lock();
            cache.get_object(class).map(|addr| {
                self.track(addr, size, Some(class));
                (addr, Some(class))
            })
        } else {
            let pages = size.div_ceil(PAGE_SIZE);
            let mut heap = self.heap.lock();
            heap.allocate_large(pages).map(|addr| {
                self.track(addr, size, None);
                (addr, None)
            })
        };

        match result {
            Ok((addr, class)) => {
                let level = if class.is_some() {
                    AllocatorLogLevel::Trace
                } else {
                    AllocatorLogLevel::Debug
                };
                if self.telemetry.enabled(level) {
                    self.telemetry.record(
                        level,
                        "malloc",
                        "alloc",
                        "success",
                        LogEvent {
                            addr: Some(addr),
                            size: Some(size),
                            class,
                            ..LogEvent::default()
                        },
                    );
                }
                Ok(addr)
            }
            Err(err) => {
                self.telemetry.record(
                    AllocatorLogLevel::Warn,
                    "malloc",
                    "oom",
                    err.outcome(),
                    LogEvent {
                        size: Some(size),
                        details: err.to_string(),
                        ..LogEvent::default()
                    },
                );
                Err(err)
            }
        }
    }

    /// Records a live allocation. Callers hold the lock of the tier the
    /// object came from, so no object is ever outside every tier.
    fn track(&self, addr: usize, size: usize, class: Option<usize>) {
        self.live.lock().insert(
            addr,
            AllocationRecord {
                user_size: size,
                class,
            },
        );
    }

    /// Frees the allocation starting at `addr`.
    ///
    /// Null addresses, addresses the allocator never handed out, and
    /// addresses inside already-free spans are tolerated and reported.
    ///
    /// # Panics
    ///
    /// If `addr` is a small object that is already free.
    pub fn free(&self, addr: usize) -> FreeOutcome {
        if addr == 0 {
            return FreeOutcome::Null;
        }
        // The cache lock is held until the object is back in a tier.
        let mut cache = self.cache.lock();
        let record = self.live.lock().remove(&addr);
        let Some(record) = record else {
            drop(cache);
            return self.stray_free(addr);
        };

        match record.class {
            Some(class) => cache.insert(class, addr),
            None => {
                let mut heap = self.heap.lock();
                let id = heap
                    .span_of(addr)
                    .filter(|&id| {
                        let span = &heap.spans()[id];
                        span.state == SpanState::AllocatedLarge && span.start == addr
                    })
                    .unwrap_or_else(|| panic!("large allocation {addr:#x} lost its span"));
                heap.release_span(id);
            }
        }
        drop(cache);

        let level = if record.class.is_some() {
            AllocatorLogLevel::Trace
        } else {
            AllocatorLogLevel::Debug
        };
        if self.telemetry.enabled(level) {
            self.telemetry.record(
                level,
                "free",
                "free",
                "released",
                LogEvent {
                    addr: Some(addr),
                    size: Some(record.user_size),
                    class: record.class,
                    ..LogEvent::default()
                },
            );
        }
        FreeOutcome::Released
    }

    /// Classifies a free of an address with no outstanding allocation.
    fn stray_free(&self, addr: usize) -> FreeOutcome {
        let heap = self.heap.lock();
        let span = heap.span_of(addr).map(|id| &heap.spans()[id]);
        let outcome = match span {
            None => FreeOutcome::Unowned,
            Some(span) if span.state == SpanState::Free => FreeOutcome::AlreadyFree,
            Some(span)
                if span.state == SpanState::AllocatedSmall
                    && (addr - span.start) % class_to_size(span.class) == 0
                    && (addr - span.start) / class_to_size(span.class) < span.capacity() =>
            {
                let class = span.class;
                drop(heap);
                self.telemetry.record(
                    AllocatorLogLevel::Error,
                    "free",
                    "double_free",
                    "invariant_violation",
                    LogEvent {
                        addr: Some(addr),
                        class: Some(class),
                        ..LogEvent::default()
                    },
                );
                panic!("can't free pointer twice: {addr:#x}");
            }
            Some(_) => FreeOutcome::Unowned,
        };
        drop(heap);

        let label = match outcome {
            FreeOutcome::AlreadyFree => "already_free",
            _ => "unowned",
        };
        self.telemetry.record(
            AllocatorLogLevel::Debug,
            "free",
            "free",
            label,
            LogEvent {
                addr: Some(addr),
                ..LogEvent::default()
            },
        );
        outcome
    }

    /// Bytes usable at `addr`: the class size for a small allocation, the
    /// whole span for a large one.
    pub fn usable_size(&self, addr: usize) -> Option<usize> {
        let record = *self.live.lock().get(&addr)?;
        Some(match record.class {
            Some(class) => class_to_size(class),
            None => record.user_size.div_ceil(PAGE_SIZE) * PAGE_SIZE,
        })
    }

    /// Returns every cached object to the central lists, letting fully
    /// free spans go back to the page heap.
    pub fn flush_cache(&self) {
        self.cache.lock().flush();
    }

    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats::default();
        {
            let cache = self.cache.lock();
            stats.cache_bytes = cache.size();
            stats.cache_hits = cache.hits();
            stats.cache_misses = cache.misses();
        }
        stats.central_free_bytes = self.central.free_bytes();
        {
            let heap = self.heap.lock();
            stats.free_pages = heap.free_pages();
            stats.spans_in_use = heap
                .spans()
                .iter()
                .filter(|(_, span)| span.state != SpanState::Free)
                .count();
            stats.host_reserved_bytes = heap.host_reserved_bytes();
            stats.host_reservations = heap.host_reservations();
        }
        let live = self.live.lock();
        stats.live_objects = live.len();
        stats.live_bytes = live.values().map(|record| record.user_size).sum();
        stats
    }

    /// Page counts of the page heap's free spans, smallest first.
    pub fn free_span_page_counts(&self) -> Vec<usize> {
        self.heap.lock().free_span_page_counts()
    }

    /// Verifies the cross-tier invariants.
    ///
    /// Every slot of every carved span is owned by exactly one of the cache,
    /// the central lists, or a live caller; free spans sit in the bucket for
    /// their page count; no two spans overlap.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let cache = self.cache.lock();
        let central = self.central.lock();
        let live = self.live.lock();
        let heap: &PageHeap = &central.heap;
        heap.check()?;

        let mut owned = HashSet::new();
        let mut per_span: HashMap<SpanId, usize> = HashMap::new();
        let mut claim = |addr: usize, class: usize| -> Result<(), InvariantViolation> {
            if !owned.insert(addr) {
                return Err(InvariantViolation::DoubleOwned { addr });
            }
            let id = heap
                .span_of(addr)
                .filter(|&id| {
                    let span = &heap.spans()[id];
                    let size = class_to_size(class);
                    let offset = addr - span.start;
                    span.state == SpanState::AllocatedSmall
                        && span.class == class
                        && offset % size == 0
                        && offset / size < span.capacity()
                })
                .ok_or(InvariantViolation::StrayObject { addr, class })?;
            *per_span.entry(id).or_default() += 1;
            Ok(())
        };

        for (class, addr) in cache.objects() {
            claim(addr, class)?;
        }
        for (class, list) in central.state.spans.iter().enumerate() {
            for id in list.ids(heap.spans()) {
                for &addr in &heap.spans()[id].free_objects {
                    claim(addr, class)?;
                }
            }
        }
        for (&addr, record) in live.iter() {
            match record.class {
                Some(class) => claim(addr, class)?,
                None => {
                    let whole = heap
                        .span_of(addr)
                        .is_some_and(|id| {
                            let span = &heap.spans()[id];
                            span.state == SpanState::AllocatedLarge && span.start == addr
                        });
                    if !whole {
                        return Err(InvariantViolation::Unmapped { start: addr });
                    }
                }
            }
        }

        for (id, span) in heap.spans().iter() {
            if span.state != SpanState::AllocatedSmall {
                continue;
            }
            let accounted = per_span.get(&id).copied().unwrap_or(0);
            if accounted != span.capacity() {
                return Err(InvariantViolation::LostObjects {
                    start: span.start,
                    owned: accounted,
                    capacity: span.capacity(),
                });
            }
        }
        Ok(())
    }

    pub fn lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.telemetry.records()
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.telemetry.drain()
    }

    /// Renders the retained lifecycle records as JSON lines.
    pub fn export_lifecycle_logs_jsonl(&self) -> serde_json::Result<String> {
        log::to_jsonl(&self.telemetry.records())
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}
