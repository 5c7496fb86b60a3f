#![no_main]
use libfuzzer_sys::fuzz_target;
use spanalloc_core::{Allocator, AllocatorConfig, AllocatorLogLevel, FreeOutcome};

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: opcode, then a little-endian size
    // or slot index.
    if data.len() < 4 {
        return;
    }

    let alloc = Allocator::with_config(AllocatorConfig {
        cache_limit_bytes: 16 * 1024,
        host_limit_bytes: Some(64 << 20),
        log_level: AllocatorLogLevel::Error,
        ..AllocatorConfig::default()
    });
    let mut allocations: Vec<usize> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let arg = u32::from_le_bytes([chunk[1], chunk[2], chunk[3], 0]) as usize;
        match chunk[0] % 5 {
            0 | 1 => {
                // Small sizes dominate; the top bit of the argument asks for a
                // large request.
                let size = if arg & 0x80_0000 != 0 {
                    arg & 0x7_ffff
                } else {
                    arg & 0x7fff
                };
                let addr = alloc.malloc(size);
                if addr != 0 {
                    allocations.push(addr);
                }
            }
            2 => {
                if !allocations.is_empty() {
                    let addr = allocations.swap_remove(arg % allocations.len());
                    assert_eq!(alloc.free(addr), FreeOutcome::Released);
                }
            }
            3 => {
                // Stray addresses must be tolerated, never corrupt state.
                let stray = arg.wrapping_mul(4099) | 1;
                assert_ne!(alloc.free(stray), FreeOutcome::Released);
            }
            _ => alloc.flush_cache(),
        }
    }

    if let Err(err) = alloc.check_invariants() {
        panic!("invariant violated: {err}");
    }
    for addr in allocations {
        assert_eq!(alloc.free(addr), FreeOutcome::Released);
    }
    alloc.flush_cache();
    assert_eq!(alloc.stats().spans_in_use, 0);
});
