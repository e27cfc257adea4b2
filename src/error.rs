use thiserror::Error;

/// Errors the allocator reports back to its immediate caller.
///
/// Every check that can produce one of these runs before the heap is
/// touched, so a failed call leaves both lists exactly as they were.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The page source refused to map more memory.
    #[error("out of memory: could not map {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The block behind `addr` is already free.
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },

    /// The block behind `addr` was released and is being used again.
    #[error("use of {addr:#x} after it was released")]
    UseAfterFree { addr: usize },

    /// `addr` does not point to a payload handed out by this allocator.
    #[error("pointer {addr:#x} was not allocated here")]
    UnknownPointer { addr: usize },
}

impl AllocError {
    /// Whether the error means the heap was handed something it never owned.
    /// [`crate::MemAlloc`] aborts on these when acting as the global allocator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DoubleFree { .. } | Self::UseAfterFree { .. } | Self::UnknownPointer { .. }
        )
    }
}
