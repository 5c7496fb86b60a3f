use spanalloc_core::AllocError;
use thiserror::Error;

use crate::object::ObjRef;

/// Failure of a VM operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("operand stack overflow (capacity {capacity})")]
    StackOverflow { capacity: usize },
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("{0} is not a pair")]
    NotAPair(ObjRef),
    #[error("{0} is not a live object")]
    UnknownObject(ObjRef),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}
