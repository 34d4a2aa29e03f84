/*!
Untyped operations on managed blocks, addressed by their payload pointer

A handle is an `Option<RawHandle>`, where `None` plays the part of a null
pointer: every operation accepts it and does nothing. Apart from the
allocators these functions are `unsafe`, since nothing stops a caller from
passing a handle that was already released or never allocated here.

```
use rcblock::raw;

unsafe {
    let mut h1 = raw::new::<i32>();
    h1.unwrap().cast::<i32>().as_ptr().write(7);

    let mut h2 = raw::clone(h1);
    assert_eq!(raw::get_count(h1), 2);

    // Not the last owner, the slot keeps its address
    raw::drop(&mut h1);
    assert_eq!(h1, h2);
    assert_eq!(raw::get_count(h2), 1);

    raw::drop(&mut h2);
    assert!(h2.is_none());
    assert_eq!(raw::get_count(h2), raw::NO_OBJECT);
}
```
*/

use std::alloc::Layout;
use std::mem;
use std::ptr::NonNull;

use crate::block::{self, RawHandle, ReleaseFn, MAX_ALIGN, MAX_REFS};
use crate::ordering::{MemoryOrdering, Synchronized};

/// Count reported for a missing handle
pub const NO_OBJECT: isize = -1;

/// Default release function, the block is simply deallocated
///
/// # Safety
/// Always safe to call, it never touches the payload
pub unsafe fn release_nothing(_payload: NonNull<u8>) {}

// -------------------------------------

/**
Allocate a block with `size` payload bytes and an owner count of one

The payload is aligned to [`MAX_ALIGN`] and left uninitialized. Returns `None`
if the allocator fails, in which case nothing was allocated.
*/
pub fn allocate(size: usize, release: ReleaseFn) -> Option<RawHandle> {
    let Ok(layout) = Layout::from_size_align(size, MAX_ALIGN) else {
        log::warn!("Refusing to allocate block with {size} payload bytes");
        return None;
    };
    allocate_layout(layout, 0, release)
}

/// Allocate a block for an arbitrary payload layout, recording `len` elements in its header
pub fn allocate_layout(layout: Layout, len: usize, release: ReleaseFn) -> Option<RawHandle> {
    match block::allocate(layout, len, release) {
        Ok(handle) => Some(handle),
        Err(err) => {
            log::warn!("Failed to allocate block: {err}");
            None
        }
    }
}

// -------------------------------------

/// Add an owner, see [`increment_with`]
///
/// # Safety
/// See [`increment_with`]
#[inline]
pub unsafe fn increment(handle: Option<RawHandle>) -> Option<RawHandle> {
    increment_with::<Synchronized>(handle)
}

/**
Add an owner to the block, returning the same handle

There is no check against [`MAX_REFS`] here, going past it only makes the block
look invalid to [`is_valid`].

# Safety
`handle` must be `None` or a live handle from this module
*/
#[inline]
pub unsafe fn increment_with<O: MemoryOrdering>(handle: Option<RawHandle>) -> Option<RawHandle> {
    let handle = handle?;
    block::header(handle).count.fetch_add(1, O::INCREMENT);
    Some(handle)
}

/// Remove an owner, see [`decrement_with`]
///
/// # Safety
/// See [`decrement_with`]
#[inline]
pub unsafe fn decrement(handle: Option<RawHandle>) -> Option<RawHandle> {
    decrement_with::<Synchronized>(handle)
}

/**
Remove an owner from the block

If this was the last owner the release function is called on the payload, the
block is freed and `None` is returned. Otherwise the same handle comes back.

# Safety
- `handle` must be `None` or a live handle from this module
- The caller must give up one ownership of the block, decrementing more
  often than there are owners is undefined behaviour
*/
#[inline]
pub unsafe fn decrement_with<O: MemoryOrdering>(handle: Option<RawHandle>) -> Option<RawHandle> {
    let handle = handle?;
    if block::header(handle).count.fetch_sub(1, O::DECREMENT) != 1 {
        return Some(handle);
    }

    O::before_release();
    release(handle);
    None
}

/// Run the release function and free the block
///
/// SAFETY: The count of the block has just gone from one to zero on this thread
unsafe fn release(handle: RawHandle) {
    log::trace!("Releasing block {handle:p}");

    if let Some(release) = block::header(handle).release {
        release(handle);
    }

    block::free(handle);
}

/// Current number of owners, see [`get_count_with`]
///
/// # Safety
/// See [`get_count_with`]
#[inline]
pub unsafe fn get_count(handle: Option<RawHandle>) -> isize {
    get_count_with::<Synchronized>(handle)
}

/**
Current number of owners of the block, or [`NO_OBJECT`] for `None`

The value may be stale by the time it is returned if other threads own the block.

# Safety
`handle` must be `None` or a live handle from this module
*/
pub unsafe fn get_count_with<O: MemoryOrdering>(handle: Option<RawHandle>) -> isize {
    match handle {
        Some(handle) => block::header(handle).count.load(O::LOAD) as isize,
        None => NO_OBJECT,
    }
}

// -------------------------------------

/**
Best-effort check that `handle` looks like a live managed block

A handle is rejected if it is `None`, not pointer-aligned, has a count outside
`1..=MAX_REFS`, or has no release function. Arbitrary memory can pass these
checks by accident, so this is a misuse detector and never a guarantee.

# Safety
If `handle` is pointer-aligned, the [`HEADER_SIZE`](crate::HEADER_SIZE) bytes in
front of it must be readable
*/
pub unsafe fn is_valid(handle: Option<RawHandle>) -> bool {
    let Some(handle) = handle else {
        return false;
    };

    if handle.as_ptr() as usize % mem::align_of::<*const ()>() != 0 {
        return false;
    }

    let (count, release) = block::peek(handle);
    (1..=MAX_REFS).contains(&count) && release.is_some()
}

// -------------------------------------

/// Allocate an uninitialized `T` with the default release function
pub fn new<T>() -> Option<RawHandle> {
    new_with_release::<T>(release_nothing)
}

/// Allocate `n` uninitialized, contiguous `T`s with the default release function
pub fn new_array<T>(n: usize) -> Option<RawHandle> {
    let Ok(layout) = Layout::array::<T>(n) else {
        log::warn!("Refusing to allocate array of {n} elements");
        return None;
    };
    allocate_layout(layout, n, release_nothing)
}

/// Allocate an uninitialized `T` with a custom release function
pub fn new_with_release<T>(release: ReleaseFn) -> Option<RawHandle> {
    allocate_layout(Layout::new::<T>(), 1, release)
}

/// Register a new owner, the result is meant to be stored in a new variable
///
/// # Safety
/// See [`increment_with`]
#[inline]
pub unsafe fn clone(handle: Option<RawHandle>) -> Option<RawHandle> {
    increment(handle)
}

/**
Give up the ownership held by `slot`, leaving `None` behind if the block was released

Only `slot` is updated, other handles to the same block still hold the address
and must not be used after the final release.

# Safety
See [`decrement_with`]
*/
#[inline]
pub unsafe fn drop(slot: &mut Option<RawHandle>) {
    *slot = decrement(*slot);
}

/// Like [`clone`], but returns `None` and logs an error if the handle looks invalid
///
/// # Safety
/// Same requirements as [`is_valid`]. If the check passes by accident on memory
/// that is not a live block the behaviour is undefined.
pub unsafe fn clone_checked(handle: Option<RawHandle>) -> Option<RawHandle> {
    if let Some(ptr) = handle {
        if !is_valid(handle) {
            log::error!("clone_checked: invalid handle {ptr:p}, not cloning");
            return None;
        }
    }

    increment(handle)
}

/**
Like [`drop`], but first checks that the slot holds something that looks like a block

If the check fails an error is logged, neither `slot` nor the memory it points
to is touched, and `false` is returned.

# Safety
Same requirements as [`is_valid`]. If the check passes by accident on memory
that is not a live block the behaviour is undefined.
*/
pub unsafe fn drop_checked(slot: &mut Option<RawHandle>) -> bool {
    if let Some(ptr) = *slot {
        if !is_valid(*slot) {
            log::error!("drop_checked: invalid handle {ptr:p}, not dropping");
            return false;
        }
    }

    drop(slot);
    true
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    use super::*;
    use crate::ordering::Relaxed;
    use crate::HEADER_SIZE;

    /// Payload layout used by the counting tests: a pointer to a per-test counter
    type Payload = *const AtomicUsize;

    unsafe fn count_release(payload: NonNull<u8>) {
        let counter = payload.cast::<Payload>().as_ptr().read();
        (*counter).fetch_add(1, SeqCst);
    }

    fn counted(counter: &AtomicUsize) -> Option<RawHandle> {
        let handle = new_with_release::<Payload>(count_release);
        let ptr: Payload = counter;
        unsafe { handle.unwrap().cast::<Payload>().as_ptr().write(ptr) };
        handle
    }

    #[test]
    fn allocate_starts_at_one() {
        for size in [0, 1, 4, 100, 4096] {
            let handle = allocate(size, release_nothing);
            assert!(handle.is_some());
            unsafe {
                assert_eq!(get_count(handle), 1);
                assert_eq!(handle.unwrap().as_ptr() as usize % MAX_ALIGN, 0);
                assert_eq!(decrement(handle), None);
            }
        }
    }

    #[test]
    fn allocate_too_large() {
        assert_eq!(allocate(usize::MAX, release_nothing), None);
        assert_eq!(new_array::<u64>(usize::MAX / 4), None);
    }

    #[test]
    fn increment_keeps_address() {
        let counter = AtomicUsize::new(0);
        let h1 = counted(&counter);

        unsafe {
            let h2 = increment(h1);
            assert_eq!(h1, h2);
            assert_eq!(get_count(h1), 2);

            assert_eq!(decrement(h1), h1);
            assert_eq!(get_count(h2), 1);
            assert_eq!(counter.load(SeqCst), 0);

            assert_eq!(decrement(h2), None);
        }
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn relaxed_policy() {
        let counter = AtomicUsize::new(0);
        let handle = counted(&counter);

        unsafe {
            increment_with::<Relaxed>(handle);
            increment_with::<Relaxed>(handle);
            assert_eq!(get_count_with::<Relaxed>(handle), 3);

            assert_eq!(decrement_with::<Relaxed>(handle), handle);
            assert_eq!(decrement_with::<Relaxed>(handle), handle);
            assert_eq!(counter.load(SeqCst), 0);
            assert_eq!(decrement_with::<Relaxed>(handle), None);
        }
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn null_handles() {
        unsafe {
            assert_eq!(increment(None), None);
            assert_eq!(decrement(None), None);
            assert_eq!(get_count(None), NO_OBJECT);
            assert_eq!(get_count(None), -1);
            assert!(!is_valid(None));
            assert_eq!(clone(None), None);
            assert_eq!(clone_checked(None), None);

            let mut slot = None;
            drop(&mut slot);
            assert!(drop_checked(&mut slot));
            assert_eq!(slot, None);
        }
    }

    #[test]
    fn allocated_blocks_are_valid() {
        let handle = allocate(0, release_nothing);
        unsafe {
            assert!(is_valid(handle));
            decrement(handle);
        }

        let handle = new_array::<u16>(7);
        unsafe {
            assert!(is_valid(handle));
            decrement(handle);
        }
    }

    /// Header-sized scratch memory followed by a fake payload
    #[repr(C, align(16))]
    struct Fake([usize; 8]);

    impl Fake {
        fn handle(&mut self) -> RawHandle {
            let words = HEADER_SIZE / mem::size_of::<usize>();
            NonNull::from(&mut self.0[words]).cast()
        }
    }

    #[test]
    fn foreign_memory_is_invalid() {
        // Zeroed: count of zero
        let mut fake = Fake([0; 8]);
        assert!(!unsafe { is_valid(Some(fake.handle())) });

        // Count too large, release function present
        let release: ReleaseFn = release_nothing;
        fake.0[0] = MAX_REFS + 1;
        fake.0[1] = release as usize;
        assert!(!unsafe { is_valid(Some(fake.handle())) });

        // Plausible count, but no release function
        fake.0[0] = 3;
        fake.0[1] = 0;
        assert!(!unsafe { is_valid(Some(fake.handle())) });

        // Both plausible, which is a false positive the check cannot catch
        fake.0[1] = release as usize;
        assert!(unsafe { is_valid(Some(fake.handle())) });
    }

    #[test]
    fn misaligned_is_invalid() {
        let handle = allocate(16, release_nothing);
        unsafe {
            let misaligned = NonNull::new(handle.unwrap().as_ptr().add(1));
            assert!(!is_valid(misaligned));
            decrement(handle);
        }
    }

    #[test]
    fn checked_operations_refuse_garbage() {
        let mut fake = Fake([0; 8]);
        let handle = Some(fake.handle());

        unsafe {
            assert_eq!(clone_checked(handle), None);

            let mut slot = handle;
            assert!(!drop_checked(&mut slot));
            assert_eq!(slot, handle);
        }

        assert!(fake.0.iter().all(|&word| word == 0));
    }

    #[test]
    fn checked_operations_on_live_block() {
        let counter = AtomicUsize::new(0);
        let mut h1 = counted(&counter);

        unsafe {
            let mut h2 = clone_checked(h1);
            assert_eq!(h2, h1);
            assert_eq!(get_count(h1), 2);

            assert!(drop_checked(&mut h1));
            assert_eq!(h1, h2);
            assert_eq!(get_count(h2), 1);

            assert!(drop_checked(&mut h2));
            assert_eq!(h2, None);
        }
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn three_owners() {
        let counter = AtomicUsize::new(0);
        let mut h1 = counted(&counter);

        unsafe {
            assert_eq!(get_count(h1), 1);
            let mut h2 = clone(h1);
            let mut h3 = clone(h1);
            assert_eq!(get_count(h1), 3);

            drop(&mut h1);
            assert_eq!(h1, h2);
            assert_eq!(get_count(h2), 2);
            assert_eq!(counter.load(SeqCst), 0);

            drop(&mut h2);
            assert_eq!(get_count(h3), 1);
            assert_eq!(counter.load(SeqCst), 0);

            drop(&mut h3);
            assert_eq!(h3, None);
        }
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn drop_clears_slot_only_on_release() {
        let counter = AtomicUsize::new(0);
        let handle = counted(&counter);

        unsafe {
            let mut first = handle;
            let mut second = clone(handle);
            assert_eq!(get_count(handle), 2);

            drop(&mut first);
            assert_eq!(first, handle);
            assert_eq!(get_count(second), 1);
            assert_eq!(counter.load(SeqCst), 0);

            drop(&mut second);
            assert_eq!(second, None);
        }
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn array_payload() {
        let mut handle = new_array::<i32>(5);
        unsafe {
            let ptr = handle.unwrap().cast::<i32>().as_ptr();
            for i in 0..5 {
                ptr.add(i).write(i as i32 * 10);
            }
            for i in 0..5 {
                assert_eq!(*ptr.add(i), i as i32 * 10);
            }
            assert_eq!(get_count(handle), 1);
            drop(&mut handle);
        }
        assert_eq!(handle, None);
    }
}
