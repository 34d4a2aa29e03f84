use std::alloc::Layout;

use thiserror::Error;

/// Reasons a managed block could not be created
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The global allocator returned null
    #[error("out of memory allocating {} bytes (align {})", .layout.size(), .layout.align())]
    OutOfMemory { layout: Layout },

    /// Header plus payload does not fit in `isize::MAX` bytes
    #[error("requested block size overflows isize::MAX")]
    CapacityOverflow,
}
