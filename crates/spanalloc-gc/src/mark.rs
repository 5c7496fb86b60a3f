//! Mark strategies.
//!
//! A strategy sets the mark bit on every object reachable from the roots.
//! Sweeping is shared and lives in [`ObjectHeap::sweep`].

use crate::object::{ObjRef, ObjectHeap};
use crate::vm::VmConfig;

pub trait MarkStrategy {
    /// Label recorded in collection reports.
    const NAME: &'static str;

    fn new(config: &VmConfig) -> Self;

    /// Marks everything reachable from `roots`.
    fn mark(&mut self, heap: &mut ObjectHeap, roots: &[ObjRef]);
}

/// Recursion depth past which [`RecursiveMarker`] defers objects to its
/// work list instead of descending further.
pub const MAX_MARK_DEPTH: usize = 1024;

/// Depth-first recursive marking. The mark bit stops revisits, so cycles
/// terminate.
///
/// Recursion stops at [`MAX_MARK_DEPTH`]: an object reached that deep is
/// marked and queued, and its children are marked by a fresh recursion once
/// the current one unwinds. Arbitrarily long chains therefore use bounded
/// native stack.
#[derive(Debug, Default, Clone)]
pub struct RecursiveMarker {
    deferred: Vec<ObjRef>,
    deferrals: usize,
}

impl RecursiveMarker {
    /// Objects queued because they were reached at the depth limit, over
    /// this marker's lifetime.
    pub fn deferrals(&self) -> usize {
        self.deferrals
    }

    fn mark_object(&mut self, heap: &mut ObjectHeap, obj: ObjRef, depth: usize) {
        if !heap.mark(obj) {
            return;
        }
        if depth >= MAX_MARK_DEPTH {
            self.deferred.push(obj);
            self.deferrals += 1;
            return;
        }
        self.mark_children(heap, obj, depth);
    }

    fn mark_children(&mut self, heap: &mut ObjectHeap, obj: ObjRef, depth: usize) {
        if let Some([head, tail]) = heap.children(obj) {
            self.mark_object(heap, head, depth + 1);
            self.mark_object(heap, tail, depth + 1);
        }
    }
}

impl MarkStrategy for RecursiveMarker {
    const NAME: &'static str = "mark_sweep";

    fn new(_config: &VmConfig) -> Self {
        Self::default()
    }

    fn mark(&mut self, heap: &mut ObjectHeap, roots: &[ObjRef]) {
        self.deferred.clear();
        for &root in roots {
            self.mark_object(heap, root, 0);
            while let Some(obj) = self.deferred.pop() {
                self.mark_children(heap, obj, 0);
            }
        }
    }
}

/// Tri-color marking over a bounded gray stack.
///
/// White objects are unmarked, gray ones are marked and waiting on the
/// stack, black ones are marked and scanned. When the stack is full a newly
/// marked object is left unscanned; once the stack drains, every marked
/// object is rescanned until a pass completes without overflow.
#[derive(Debug, Clone)]
pub struct TriColorMarker {
    gray: Vec<ObjRef>,
    capacity: usize,
    overflowed: bool,
    rescans: usize,
}

impl TriColorMarker {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            gray: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
            rescans: 0,
        }
    }

    /// Overflow rescans performed over this marker's lifetime.
    pub fn rescans(&self) -> usize {
        self.rescans
    }

    fn shade(&mut self, heap: &mut ObjectHeap, obj: ObjRef) {
        if !heap.mark(obj) {
            return;
        }
        if self.gray.len() < self.capacity {
            self.gray.push(obj);
        } else {
            self.overflowed = true;
        }
    }

    fn blacken(&mut self, heap: &mut ObjectHeap, obj: ObjRef) {
        if let Some([head, tail]) = heap.children(obj) {
            self.shade(heap, head);
            self.shade(heap, tail);
        }
    }

    fn trace_references(&mut self, heap: &mut ObjectHeap) {
        while let Some(obj) = self.gray.pop() {
            self.blacken(heap, obj);
        }
    }
}

impl MarkStrategy for TriColorMarker {
    const NAME: &'static str = "tri_color";

    fn new(config: &VmConfig) -> Self {
        Self::with_capacity(config.gray_capacity)
    }

    fn mark(&mut self, heap: &mut ObjectHeap, roots: &[ObjRef]) {
        self.gray.clear();
        self.overflowed = false;
        for &root in roots {
            self.shade(heap, root);
        }
        self.trace_references(heap);

        while self.overflowed {
            self.overflowed = false;
            self.rescans += 1;
            for obj in heap.marked() {
                self.blacken(heap, obj);
                self.trace_references(heap);
            }
        }
    }
}
