//! # spanalloc-gc
//!
//! A toy stack VM whose objects live in [`spanalloc_core::Allocator`]
//! memory, with two interchangeable collectors: recursive mark-sweep and
//! tri-color marking over a bounded gray stack. Both share one sweep.

#![deny(unsafe_code)]

pub mod error;
pub mod mark;
pub mod object;
pub mod vm;

pub use error::VmError;
pub use mark::{MAX_MARK_DEPTH, MarkStrategy, RecursiveMarker, TriColorMarker};
pub use object::{GcObject, OBJECT_BYTES, ObjRef, ObjectHeap, ObjectKind};
pub use vm::{CollectionReport, MarkSweepVm, TriColorVm, Vm, VmConfig};
