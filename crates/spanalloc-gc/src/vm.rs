//! The collector VM.
//!
//! The operand stack is the root set. Allocating an object when the live
//! count has reached the threshold runs a full collection first. After a
//! collection the threshold doubles, or resets to its initial value when
//! nothing survived.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use spanalloc_core::Allocator;

use crate::error::VmError;
use crate::mark::{MarkStrategy, RecursiveMarker, TriColorMarker};
use crate::object::{ObjRef, ObjectHeap, ObjectKind};

/// Default operand stack capacity.
pub const STACK_MAX: usize = 256;
/// Default gray stack capacity for tri-color marking.
pub const GRAY_MAX: usize = 256;
/// Live-object count that triggers the first collection.
pub const INITIAL_GC_THRESHOLD: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub stack_capacity: usize,
    pub initial_threshold: usize,
    pub gray_capacity: usize,
    /// Collection reports kept; older ones are dropped first.
    pub history_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_capacity: STACK_MAX,
            initial_threshold: INITIAL_GC_THRESHOLD,
            gray_capacity: GRAY_MAX,
            history_capacity: 64,
        }
    }
}

/// Outcome of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub collected: usize,
    pub remaining: usize,
    pub next_threshold: usize,
    pub strategy: &'static str,
}

impl fmt::Display for CollectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Collected {} objects, {} remaining.",
            self.collected, self.remaining
        )
    }
}

pub struct Vm<M: MarkStrategy = RecursiveMarker> {
    heap: ObjectHeap,
    stack: Vec<ObjRef>,
    threshold: usize,
    marker: M,
    history: VecDeque<CollectionReport>,
    config: VmConfig,
}

/// VM collected by recursive mark-sweep.
pub type MarkSweepVm = Vm<RecursiveMarker>;
/// VM collected by tri-color marking.
pub type TriColorVm = Vm<TriColorMarker>;

impl<M: MarkStrategy> Vm<M> {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self::with_config(allocator, VmConfig::default())
    }

    pub fn with_config(allocator: Arc<Allocator>, config: VmConfig) -> Self {
        let initial_threshold = config.initial_threshold.max(1);
        Self {
            heap: ObjectHeap::new(allocator),
            stack: Vec::with_capacity(config.stack_capacity),
            threshold: initial_threshold,
            marker: M::new(&config),
            history: VecDeque::with_capacity(config.history_capacity),
            config: VmConfig {
                initial_threshold,
                ..config
            },
        }
    }

    fn push(&mut self, obj: ObjRef) -> Result<(), VmError> {
        if self.stack.len() >= self.config.stack_capacity {
            return Err(VmError::StackOverflow {
                capacity: self.config.stack_capacity,
            });
        }
        self.stack.push(obj);
        Ok(())
    }

    fn new_object(&mut self, kind: ObjectKind) -> Result<ObjRef, VmError> {
        if self.heap.len() >= self.threshold {
            self.gc();
        }
        Ok(self.heap.allocate(kind)?)
    }

    /// Allocates an integer and pushes it.
    pub fn push_int(&mut self, value: i64) -> Result<ObjRef, VmError> {
        if self.stack.len() >= self.config.stack_capacity {
            return Err(VmError::StackOverflow {
                capacity: self.config.stack_capacity,
            });
        }
        let obj = self.new_object(ObjectKind::Int(value))?;
        self.push(obj)?;
        Ok(obj)
    }

    /// Pops the head then the tail, allocates a pair of them, and pushes it.
    ///
    /// The operands stay on the stack, and so stay rooted, while the pair
    /// is allocated.
    pub fn push_pair(&mut self) -> Result<ObjRef, VmError> {
        let depth = self.stack.len();
        if depth < 2 {
            return Err(VmError::StackUnderflow);
        }
        let head = self.stack[depth - 1];
        let tail = self.stack[depth - 2];
        let obj = self.new_object(ObjectKind::Pair { head, tail })?;
        self.stack.truncate(depth - 2);
        self.push(obj)?;
        Ok(obj)
    }

    pub fn pop(&mut self) -> Result<ObjRef, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    pub fn peek(&self) -> Option<ObjRef> {
        self.stack.last().copied()
    }

    pub fn set_head(&mut self, pair: ObjRef, value: ObjRef) -> Result<(), VmError> {
        let (head, _) = self.pair_slots(pair, value)?;
        *head = value;
        Ok(())
    }

    pub fn set_tail(&mut self, pair: ObjRef, value: ObjRef) -> Result<(), VmError> {
        let (_, tail) = self.pair_slots(pair, value)?;
        *tail = value;
        Ok(())
    }

    fn pair_slots(
        &mut self,
        pair: ObjRef,
        value: ObjRef,
    ) -> Result<(&mut ObjRef, &mut ObjRef), VmError> {
        if !self.heap.contains(value) {
            return Err(VmError::UnknownObject(value));
        }
        let object = self
            .heap
            .get_mut(pair)
            .ok_or(VmError::UnknownObject(pair))?;
        match &mut object.kind {
            ObjectKind::Pair { head, tail } => Ok((head, tail)),
            ObjectKind::Int(_) => Err(VmError::NotAPair(pair)),
        }
    }

    pub fn int_value(&self, obj: ObjRef) -> Option<i64> {
        match self.heap.get(obj)?.kind {
            ObjectKind::Int(value) => Some(value),
            ObjectKind::Pair { .. } => None,
        }
    }

    /// `(head, tail)` of a pair.
    pub fn pair_children(&self, obj: ObjRef) -> Option<(ObjRef, ObjRef)> {
        self.heap.children(obj).map(|[head, tail]| (head, tail))
    }

    /// Runs a full collection. Returns `None` when there was nothing to
    /// collect.
    pub fn gc(&mut self) -> Option<CollectionReport> {
        let before = self.heap.len();
        if before == 0 {
            return None;
        }

        self.marker.mark(&mut self.heap, &self.stack);
        let collected = self.heap.sweep();
        let remaining = self.heap.len();

        self.threshold = if remaining == 0 {
            self.config.initial_threshold
        } else {
            self.threshold.saturating_mul(2)
        };

        let report = CollectionReport {
            collected,
            remaining,
            next_threshold: self.threshold,
            strategy: M::NAME,
        };
        if self.config.history_capacity > 0 {
            if self.history.len() == self.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(report.clone());
        }
        Some(report)
    }

    /// Drops every root and collects.
    pub fn free(&mut self) -> Option<CollectionReport> {
        self.stack.clear();
        self.gc()
    }

    pub fn object_count(&self) -> usize {
        self.heap.len()
    }

    /// Live-object count at which the next allocation collects first.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Recent collection reports, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &CollectionReport> {
        self.history.iter()
    }

    pub fn marker(&self) -> &M {
        &self.marker
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        self.heap.allocator()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> MarkSweepVm {
        Vm::new(Arc::new(Allocator::new()))
    }

    #[test]
    fn push_pair_pops_head_first() {
        let mut vm = vm();
        let one = vm.push_int(1).unwrap();
        let two = vm.push_int(2).unwrap();
        let pair = vm.push_pair().unwrap();
        assert_eq!(vm.pair_children(pair), Some((two, one)));
        assert_eq!(vm.stack_depth(), 1);
        assert_eq!(vm.peek(), Some(pair));
    }

    #[test]
    fn push_pair_needs_two_operands() {
        let mut vm = vm();
        vm.push_int(1).unwrap();
        assert_eq!(vm.push_pair(), Err(VmError::StackUnderflow));
        assert_eq!(vm.object_count(), 1);
    }

    #[test]
    fn stack_capacity_is_enforced() {
        let mut vm = MarkSweepVm::with_config(
            Arc::new(Allocator::new()),
            VmConfig {
                stack_capacity: 2,
                ..VmConfig::default()
            },
        );
        vm.push_int(1).unwrap();
        vm.push_int(2).unwrap();
        assert_eq!(vm.push_int(3), Err(VmError::StackOverflow { capacity: 2 }));
        assert_eq!(vm.object_count(), 2);
    }

    #[test]
    fn set_tail_rejects_scalars_and_dead_objects() {
        let mut vm = vm();
        let one = vm.push_int(1).unwrap();
        vm.push_int(2).unwrap();
        let pair = vm.push_pair().unwrap();
        assert_eq!(vm.set_tail(one, pair), Err(VmError::NotAPair(one)));

        vm.pop().unwrap();
        vm.gc();
        assert_eq!(vm.set_tail(pair, pair), Err(VmError::UnknownObject(pair)));
    }

    #[test]
    fn gc_on_empty_heap_reports_nothing() {
        let mut vm = vm();
        assert_eq!(vm.gc(), None);
        assert_eq!(vm.history().count(), 0);
    }

    #[test]
    fn report_renders_classic_summary() {
        let report = CollectionReport {
            collected: 3,
            remaining: 2,
            next_threshold: 16,
            strategy: "mark_sweep",
        };
        assert_eq!(report.to_string(), "Collected 3 objects, 2 remaining.");
    }
}
