//! Host memory boundary.
//!
//! The allocator never touches an operating system directly. It asks a
//! [`HostMemory`] for page-aligned address ranges and never gives them back.
//! Addresses are logical: nothing in this crate dereferences them.

use crate::malloc::PAGE_SIZE;

/// Source of fresh, zeroed, page-aligned memory.
pub trait HostMemory: Send {
    /// Reserves at least `bytes` bytes and returns the page-aligned start
    /// address, or `None` if the host refuses.
    ///
    /// Successive reservations are not guaranteed to be contiguous.
    fn reserve(&mut self, bytes: usize) -> Option<usize>;

    /// Total bytes reserved so far.
    fn reserved_bytes(&self) -> usize;

    /// Number of successful reservations so far.
    fn reservations(&self) -> usize;
}

/// Base of the simulated address space (keeps address 0 free as null).
pub const SIMULATED_BASE: usize = 0x1_0000_0000;

/// Bump-pointer host over a logical address space.
///
/// Reservations are contiguous and rounded up to whole pages. An optional
/// byte limit makes host exhaustion reproducible.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    next_base: usize,
    limit: Option<usize>,
    reserved_bytes: usize,
    reservations: usize,
}

impl SimulatedHost {
    /// Creates an unbounded host.
    pub fn new() -> Self {
        Self {
            next_base: SIMULATED_BASE,
            limit: None,
            reserved_bytes: 0,
            reservations: 0,
        }
    }

    /// Creates a host that refuses to reserve more than `limit` bytes in total.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemory for SimulatedHost {
    fn reserve(&mut self, bytes: usize) -> Option<usize> {
        if bytes == 0 {
            return None;
        }
        let rounded = bytes.checked_next_multiple_of(PAGE_SIZE)?;
        let total = self.reserved_bytes.checked_add(rounded)?;
        if self.limit.is_some_and(|limit| total > limit) {
            return None;
        }
        let base = self.next_base;
        self.next_base = base.checked_add(rounded)?;
        self.reserved_bytes = total;
        self.reservations += 1;
        Some(base)
    }

    fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    fn reservations(&self) -> usize {
        self.reservations
    }
}
