//! Layout of a managed block: a fixed-size header placed directly in front of the payload
//!
//! ```text
//! base                     header                 payload (= handle)
//!  |  padding (align > 8)  | count | release | .. | bytes ...
//! ```
//!
//! Only the payload address ever leaves this module, the header is found again
//! by stepping back [`HEADER_SIZE`] bytes.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::{self, addr_of, NonNull};

use crate::error::AllocError;
use crate::sync::{AtomicUsize, Ordering};

/// Address of a payload inside a managed block
pub type RawHandle = NonNull<u8>;

/// Finalizer invoked exactly once, on the payload address, when the last owner lets go
///
/// The backing storage is freed by the crate after the function returns,
/// so a finalizer must only clean up whatever the payload itself owns.
pub type ReleaseFn = unsafe fn(NonNull<u8>);

/// Upper bound on the number of owners a block is considered valid with
pub const MAX_REFS: usize = 0x100_0000;

/// Payload alignment used by [`allocate`](crate::raw::allocate), matching `malloc`
pub const MAX_ALIGN: usize = 16;

/// Number of bytes between the start of the header and the payload
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

#[repr(C)]
pub(crate) struct Header {
    pub(crate) count: AtomicUsize,
    pub(crate) release: Option<ReleaseFn>,
    pub(crate) len: usize,
    size: usize,
    align: usize,
}

/// Offset of the payload from the start of the allocation
const fn payload_offset(block_align: usize) -> usize {
    (HEADER_SIZE + block_align - 1) & !(block_align - 1)
}

const fn block_align(payload_align: usize) -> usize {
    let header_align = mem::align_of::<Header>();
    if payload_align > header_align {
        payload_align
    } else {
        header_align
    }
}

fn block_layout(payload: Layout) -> Option<Layout> {
    let align = block_align(payload.align());
    let size = payload_offset(align).checked_add(payload.size())?;
    Layout::from_size_align(size, align).ok()
}

pub(crate) fn header_ptr(handle: RawHandle) -> *mut Header {
    handle.as_ptr().wrapping_sub(HEADER_SIZE).cast()
}

/// Shared access to the header of a live block
///
/// SAFETY: `handle` must point into a block created by [`allocate`] that has not been freed
pub(crate) unsafe fn header<'a>(handle: RawHandle) -> &'a Header {
    &*header_ptr(handle)
}

/// Read the count and release function without assuming there is a block behind `handle`
///
/// The fields are read one by one, so any bit pattern is fine.
///
/// SAFETY: The `HEADER_SIZE` bytes in front of `handle` must be readable and pointer-aligned
pub(crate) unsafe fn peek(handle: RawHandle) -> (usize, Option<ReleaseFn>) {
    let header = header_ptr(handle);
    let count = (*addr_of!((*header).count)).load(Ordering::Relaxed);
    let release = ptr::read(addr_of!((*header).release));
    (count, release)
}

/// Place a fresh header with a count of one in front of an uninitialized payload
pub(crate) fn allocate(
    payload: Layout,
    len: usize,
    release: ReleaseFn,
) -> Result<RawHandle, AllocError> {
    let layout = block_layout(payload).ok_or(AllocError::CapacityOverflow)?;

    // SAFETY: The layout always holds the header, so it is never zero-sized
    let base = NonNull::new(unsafe { alloc::alloc(layout) })
        .ok_or(AllocError::OutOfMemory { layout })?;

    // SAFETY:
    // - The payload offset is within the allocation (size = offset + payload)
    // - The header ends exactly where the payload starts, and is aligned since
    //   both the offset and HEADER_SIZE are multiples of the header alignment
    unsafe {
        let handle = base.as_ptr().add(payload_offset(layout.align()));
        let header = Header {
            count: AtomicUsize::new(1),
            release: Some(release),
            len,
            size: payload.size(),
            align: payload.align(),
        };
        ptr::write(header_ptr(NonNull::new_unchecked(handle)), header);

        log::trace!("Allocated block {handle:p} ({} payload bytes)", payload.size());
        Ok(NonNull::new_unchecked(handle))
    }
}

/// Drop the header and give the whole block back to the allocator
///
/// SAFETY:
/// - `handle` must come from [`allocate`] and not have been freed
/// - Noone may access the block afterwards
pub(crate) unsafe fn free(handle: RawHandle) {
    let header = header_ptr(handle);
    let (size, align) = ((*header).size, (*header).align);

    let block_align = block_align(align);
    let offset = payload_offset(block_align);
    let layout = Layout::from_size_align_unchecked(offset + size, block_align);

    ptr::drop_in_place(header);
    alloc::dealloc(handle.as_ptr().sub(offset), layout);

    log::trace!("Freed block {handle:p}");
}
