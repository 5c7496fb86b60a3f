//! Allocation error taxonomy.
//!
//! Only resource exhaustion is an error. Invariant violations panic, and
//! tolerated frees are reported through [`crate::FreeOutcome`].

use thiserror::Error;

/// Failure of an allocation request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The host refused to reserve more memory.
    #[error("host refused to reserve {bytes} bytes")]
    HostExhausted { bytes: usize },
    /// The page map could not create another lookup node.
    #[error("page map node limit reached while mapping page {page:#x}")]
    PageMapExhausted { page: usize },
    /// A span request for zero pages (or an overflowing page count).
    #[error("invalid page count: {pages}")]
    InvalidPageCount { pages: usize },
}

impl AllocError {
    /// Machine-readable outcome label used in lifecycle logs.
    pub(crate) fn outcome(&self) -> &'static str {
        match self {
            Self::HostExhausted { .. } => "host_exhausted",
            Self::PageMapExhausted { .. } => "page_map_exhausted",
            Self::InvalidPageCount { .. } => "invalid_page_count",
        }
    }
}

/// A broken allocator invariant found by [`crate::Allocator::check_invariants`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("object {addr:#x} is owned twice")]
    DoubleOwned { addr: usize },
    #[error("object {addr:#x} is not a slot of a carved span of class {class}")]
    StrayObject { addr: usize, class: usize },
    #[error("carved span at {start:#x} accounts for {owned} of {capacity} objects")]
    LostObjects {
        start: usize,
        owned: usize,
        capacity: usize,
    },
    #[error("free span at {start:#x} ({pages} pages) is filed in bucket {bucket}")]
    MisfiledSpan {
        start: usize,
        pages: usize,
        bucket: usize,
    },
    #[error("free span at {start:#x} is not in any bucket")]
    UnfiledSpan { start: usize },
    #[error("spans at {first:#x} and {second:#x} overlap")]
    Overlap { first: usize, second: usize },
    #[error("span at {start:#x} is inconsistent")]
    Inconsistent { start: usize },
    #[error("page map does not resolve the span at {start:#x}")]
    Unmapped { start: usize },
}
