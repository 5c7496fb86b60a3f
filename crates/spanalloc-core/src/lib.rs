//! # spanalloc-core
//!
//! A segmented, size-classed allocator in the tcmalloc mould: a page heap
//! of spans indexed by a three-level page map, per-class central free
//! lists, and a magazine cache in front of them.
//!
//! Memory is modelled as logical page-aligned addresses handed out by a
//! [`HostMemory`]; nothing here dereferences them, so no `unsafe` code is
//! permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod host;
pub mod log;
pub mod malloc;

pub use config::AllocatorConfig;
pub use error::{AllocError, InvariantViolation};
pub use host::{HostMemory, SimulatedHost};
pub use log::{AllocatorLogLevel, AllocatorLogRecord};
pub use malloc::{Allocator, AllocatorStats, FreeOutcome, MAX_SMALL_SIZE, PAGE_SIZE};
