#![no_main]
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use spanalloc_core::{Allocator, AllocatorConfig, AllocatorLogLevel};
use spanalloc_gc::{MarkSweepVm, TriColorVm, VmConfig};

fuzz_target!(|data: &[u8]| {
    // Drives both collectors with the same program and requires them to agree.
    let allocator = Arc::new(Allocator::with_config(AllocatorConfig {
        log_level: AllocatorLogLevel::Error,
        ..AllocatorConfig::default()
    }));
    let config = VmConfig {
        gray_capacity: 4,
        ..VmConfig::default()
    };
    let mut ms = MarkSweepVm::with_config(Arc::clone(&allocator), config.clone());
    let mut tc = TriColorVm::with_config(Arc::clone(&allocator), config);

    for pair in data.chunks_exact(2) {
        let (op, arg) = (pair[0] % 6, pair[1]);
        match op {
            0 | 1 => {
                let a = ms.push_int(i64::from(arg)).is_ok();
                let b = tc.push_int(i64::from(arg)).is_ok();
                assert_eq!(a, b);
            }
            2 => assert_eq!(ms.push_pair().is_ok(), tc.push_pair().is_ok()),
            3 => assert_eq!(ms.pop().is_ok(), tc.pop().is_ok()),
            4 => {
                // A pair whose tail is itself is the smallest cycle.
                if let (Some(top_ms), Some(top_tc)) = (ms.peek(), tc.peek()) {
                    assert_eq!(
                        ms.set_tail(top_ms, top_ms).is_ok(),
                        tc.set_tail(top_tc, top_tc).is_ok()
                    );
                }
            }
            _ => {
                let a = ms.gc().map(|r| (r.collected, r.remaining));
                let b = tc.gc().map(|r| (r.collected, r.remaining));
                assert_eq!(a, b);
            }
        }
        assert_eq!(ms.object_count(), tc.object_count());
    }

    ms.free();
    tc.free();
    assert_eq!(allocator.stats().live_objects, 0);
});
