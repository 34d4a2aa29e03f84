use std::fmt;

use crate::block::{self, RawHandle, ReleaseFn};
use crate::ordering::{MemoryOrdering, Synchronized};

/// Snapshot of a block, for debugging and assertions only
#[derive(Debug, Clone, Copy)]
pub enum BlockInfo {
    /// The handle was `None`
    Null,
    /// A block that was alive when described
    Live {
        /// Payload address
        ptr: RawHandle,
        /// Owner count read from the header
        count: usize,
        /// Release function stored in the header
        release: Option<ReleaseFn>,
    },
}

impl BlockInfo {
    /// Whether the described handle was `None`
    pub fn is_null(&self) -> bool {
        matches!(self, BlockInfo::Null)
    }

    /// Number of owners when the snapshot was taken, `None` for a null handle
    pub fn count(&self) -> Option<usize> {
        match self {
            BlockInfo::Null => None,
            BlockInfo::Live { count, .. } => Some(*count),
        }
    }

    /// Emit the description at debug level
    pub fn log(&self) {
        log::debug!("{self}");
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockInfo::Null => write!(f, "RC Object: NULL pointer"),
            BlockInfo::Live {
                ptr,
                count,
                release,
            } => {
                let release = release.map_or(0, |release| release as usize);
                write!(
                    f,
                    "RC Object: ptr={ptr:p}, count={count}, destructor={release:#x}"
                )
            }
        }
    }
}

/// Describe the block behind `handle` without touching it
///
/// # Safety
/// `handle` must be `None` or a live handle from [`raw`](crate::raw)
pub unsafe fn describe(handle: Option<RawHandle>) -> BlockInfo {
    describe_with::<Synchronized>(handle)
}

/// Like [`describe`], with an explicit ordering policy for reading the count
///
/// # Safety
/// See [`describe`]
pub unsafe fn describe_with<O: MemoryOrdering>(handle: Option<RawHandle>) -> BlockInfo {
    let Some(ptr) = handle else {
        return BlockInfo::Null;
    };

    let header = block::header(ptr);
    BlockInfo::Live {
        ptr,
        count: header.count.load(O::LOAD),
        release: header.release,
    }
}
