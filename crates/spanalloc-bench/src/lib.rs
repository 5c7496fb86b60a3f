//! Shared workloads for the criterion benches.

use spanalloc_core::MAX_SMALL_SIZE;
use spanalloc_gc::{MarkStrategy, Vm, VmError};

/// Deterministic request sizes: mostly small, a few past the small-object
/// ceiling.
pub fn mixed_sizes(seed: u64, count: usize) -> Vec<usize> {
    let mut state = seed.max(1);
    (0..count)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            match state % 100 {
                0..=79 => 1 + (state >> 8) as usize % 256,
                80..=97 => 257 + (state >> 8) as usize % (MAX_SMALL_SIZE - 256),
                _ => MAX_SMALL_SIZE + 1 + (state >> 8) as usize % (16 * MAX_SMALL_SIZE),
            }
        })
        .collect()
}

/// Pushes a complete binary tree of pairs with `1 << depth` leaves, leaving
/// its root on the stack.
pub fn push_tree<M: MarkStrategy>(vm: &mut Vm<M>, depth: u32) -> Result<(), VmError> {
    if depth == 0 {
        vm.push_int(i64::from(depth))?;
        return Ok(());
    }
    push_tree(vm, depth - 1)?;
    push_tree(vm, depth - 1)?;
    vm.push_pair()?;
    Ok(())
}
