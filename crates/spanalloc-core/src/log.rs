//! Structured allocator lifecycle records.
//!
//! Every interesting allocator decision (host reservation, split, coalesce,
//! central refill, cache shrink, large allocation, failure) appends one
//! [`AllocatorLogRecord`] carrying a monotonic decision id, a trace id, and
//! a snapshot of the allocator's byte counters. Records are kept in a
//! bounded ring; formatting is left to the consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl AllocatorLogLevel {
    /// Parse from string (case-insensitive). Unknown values yield `None`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" | "err" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// Component symbol (`malloc`, `free`, `page_heap`, `central`, `cache`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `span_split`, `cache_gc`, ...).
    pub event: &'static str,
    /// Address involved in the event.
    pub addr: Option<usize>,
    /// Byte size involved in the event.
    pub size: Option<usize>,
    /// Size class involved in the event.
    pub class: Option<usize>,
    /// Page count involved in the event.
    pub pages: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: bytes sitting in the thread cache.
    pub cache_bytes: usize,
    /// Snapshot: bytes held by the central free lists.
    pub central_free_bytes: usize,
    /// Snapshot: bytes reserved from the host.
    pub host_reserved_bytes: usize,
}

/// Fields of a record supplied by the call site.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogEvent {
    pub addr: Option<usize>,
    pub size: Option<usize>,
    pub class: Option<usize>,
    pub pages: Option<usize>,
    pub details: String,
}

/// Counter snapshot stamped onto each record.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LogSnapshot {
    pub cache_bytes: usize,
    pub central_free_bytes: usize,
    pub host_reserved_bytes: usize,
}

/// Bounded ring of lifecycle records.
#[derive(Debug)]
pub(crate) struct LifecycleLog {
    records: VecDeque<AllocatorLogRecord>,
    capacity: usize,
    min_level: AllocatorLogLevel,
    next_decision_id: u64,
}

impl LifecycleLog {
    pub(crate) fn new(min_level: AllocatorLogLevel, capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            min_level,
            next_decision_id: 1,
        }
    }

    pub(crate) fn enabled(&self, level: AllocatorLogLevel) -> bool {
        self.capacity > 0 && level >= self.min_level
    }

    pub(crate) fn record(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
        fields: LogEvent,
        snapshot: LogSnapshot,
    ) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(AllocatorLogRecord {
            decision_id,
            trace_id: format!("spanalloc::{symbol}::{decision_id:016x}"),
            level,
            symbol,
            event,
            addr: fields.addr,
            size: fields.size,
            class: fields.class,
            pages: fields.pages,
            outcome,
            details: fields.details,
            cache_bytes: snapshot.cache_bytes,
            central_free_bytes: snapshot.central_free_bytes,
            host_reserved_bytes: snapshot.host_reserved_bytes,
        });
    }

    pub(crate) fn records(&self) -> Vec<AllocatorLogRecord> {
        self.records.iter().cloned().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        self.records.drain(..).collect()
    }
}

/// Shared log sink plus the byte counters stamped onto every record.
///
/// Each tier updates its own counter; the log mutex is a leaf lock and may
/// be taken while any allocator lock is held.
#[derive(Debug)]
pub(crate) struct Telemetry {
    log: Mutex<LifecycleLog>,
    cache_bytes: AtomicUsize,
    central_free_bytes: AtomicUsize,
    host_reserved_bytes: AtomicUsize,
}

impl Telemetry {
    pub(crate) fn new(min_level: AllocatorLogLevel, capacity: usize) -> Self {
        Self {
            log: Mutex::new(LifecycleLog::new(min_level, capacity)),
            cache_bytes: AtomicUsize::new(0),
            central_free_bytes: AtomicUsize::new(0),
            host_reserved_bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn enabled(&self, level: AllocatorLogLevel) -> bool {
        self.log.lock().enabled(level)
    }

    pub(crate) fn record(
        &self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
        fields: LogEvent,
    ) {
        let snapshot = self.snapshot();
        self.log
            .lock()
            .record(level, symbol, event, outcome, fields, snapshot);
    }

    pub(crate) fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            cache_bytes: self.cache_bytes.load(Ordering::Relaxed),
            central_free_bytes: self.central_free_bytes.load(Ordering::Relaxed),
            host_reserved_bytes: self.host_reserved_bytes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_cache_bytes(&self, bytes: usize) {
        self.cache_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_central_free_bytes(&self, bytes: usize) {
        self.central_free_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_host_reserved_bytes(&self, bytes: usize) {
        self.host_reserved_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn records(&self) -> Vec<AllocatorLogRecord> {
        self.log.lock().records()
    }

    pub(crate) fn drain(&self) -> Vec<AllocatorLogRecord> {
        self.log.lock().drain()
    }
}

/// Renders records as JSON lines.
pub fn to_jsonl(records: &[AllocatorLogRecord]) -> serde_json::Result<String> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(details: &str) -> LogEvent {
        LogEvent {
            details: details.to_string(),
            ..LogEvent::default()
        }
    }

    #[test]
    fn level_filter_drops_quiet_records() {
        let mut log = LifecycleLog::new(AllocatorLogLevel::Info, 8);
        log.record(
            AllocatorLogLevel::Debug,
            "malloc",
            "alloc",
            "success",
            event("dropped"),
            LogSnapshot::default(),
        );
        log.record(
            AllocatorLogLevel::Warn,
            "malloc",
            "oom",
            "host_exhausted",
            event("kept"),
            LogSnapshot::default(),
        );
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].details, "kept");
        assert_eq!(records[0].decision_id, 1);
        assert!(records[0].trace_id.starts_with("spanalloc::malloc::"));
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut log = LifecycleLog::new(AllocatorLogLevel::Trace, 2);
        for i in 0..3 {
            log.record(
                AllocatorLogLevel::Info,
                "cache",
                "cache_gc",
                "success",
                event(&i.to_string()),
                LogSnapshot::default(),
            );
        }
        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].details, "1");
        assert_eq!(drained[1].decision_id, 3);
        assert!(log.records().is_empty());
    }

    #[test]
    fn jsonl_has_one_object_per_line() {
        let mut log = LifecycleLog::new(AllocatorLogLevel::Trace, 4);
        log.record(
            AllocatorLogLevel::Error,
            "central",
            "span_not_found",
            "invariant_violation",
            LogEvent {
                addr: Some(0x1000),
                ..LogEvent::default()
            },
            LogSnapshot::default(),
        );
        let text = to_jsonl(&log.records()).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["level"], "error");
        assert_eq!(value["addr"], 4096);
    }

    #[test]
    fn parse_levels_loosely() {
        assert_eq!(
            AllocatorLogLevel::from_str_loose(" WARNING "),
            Some(AllocatorLogLevel::Warn)
        );
        assert_eq!(AllocatorLogLevel::from_str_loose("nope"), None);
    }
}
