//! Size class table for small allocations.
//!
//! Requests up to [`MAX_SMALL_SIZE`] are rounded up to one of
//! [`NUM_SIZE_CLASSES`] fixed sizes laid out in three linear bands:
//!
//! - Classes 0-7: 8-byte steps (8, 16, ..., 64)
//! - Classes 8-38: 64-byte steps (128, 192, ..., 2048)
//! - Classes 39-158: 256-byte steps (2304, 2560, ..., 32768)
//!
//! Both directions are pure arithmetic; there is no lookup table.

/// Maximum size for small allocations (bytes). Above this, use the page heap.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = 159;

const TINY_CLASSES: usize = 8;
const MEDIUM_CLASSES: usize = 31;
const TINY_LIMIT: usize = 64;
const MEDIUM_LIMIT: usize = 2048;

/// Maps a request size to its size class.
///
/// Callers must validate `1 <= size <= MAX_SMALL_SIZE` first; there is no
/// error path.
pub fn size_to_class(size: usize) -> usize {
    debug_assert!(size >= 1 && size <= MAX_SMALL_SIZE, "size {size} out of range");
    if size <= TINY_LIMIT {
        (size - 1) / 8
    } else if size <= MEDIUM_LIMIT {
        TINY_CLASSES + (size - TINY_LIMIT - 1) / 64
    } else {
        TINY_CLASSES + MEDIUM_CLASSES + (size - MEDIUM_LIMIT - 1) / 256
    }
}

/// Returns the allocation size for a size class.
pub fn class_to_size(class: usize) -> usize {
    debug_assert!(class < NUM_SIZE_CLASSES, "class {class} out of range");
    if class < TINY_CLASSES {
        8 + class * 8
    } else if class < TINY_CLASSES + MEDIUM_CLASSES {
        128 + (class - TINY_CLASSES) * 64
    } else {
        2304 + (class - TINY_CLASSES - MEDIUM_CLASSES) * 256
    }
}

/// Number of objects of `class` that fit in `bytes`.
///
/// Trailing bytes that cannot hold a whole object are not used.
pub fn objects_in(class: usize, bytes: usize) -> usize {
    bytes / class_to_size(class)
}
