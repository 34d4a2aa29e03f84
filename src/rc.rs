use std::alloc::{handle_alloc_error, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::slice;

use crate::block::{self, Header, RawHandle, ReleaseFn};
use crate::diagnostics::{self, BlockInfo};
use crate::error::AllocError;
use crate::ordering::{MemoryOrdering, Synchronized};
use crate::raw;
use crate::sync::Ordering;

/**
Owning handle to a value in a managed block

Every `RcBox` is one owner of the block. Cloning adds an owner, dropping removes
one, and the last drop runs the release function and frees the block. The
handle is a single pointer, pointing at the value itself, with the counter
stored in front of it.

```
# use rcblock::RcBox;
#
let a = RcBox::new(String::from("shared"));
let b = RcBox::clone(&a);
assert_eq!(RcBox::count(&a), 2);

drop(a);
assert_eq!(RcBox::count(&b), 1);
assert_eq!(*b, "shared");
```

The ordering policy `O` decides how owners on different threads synchronize,
see [`ordering`](crate::ordering). Only `RcBox<T, Synchronized>` may be sent
between threads.
*/
pub struct RcBox<T: ?Sized, O: MemoryOrdering = Synchronized> {
    ptr: RawHandle,
    marker: PhantomData<(Box<T>, O)>,
}

// SAFETY:
// - The final drop is ordered after every other owner's use of the value
// - Owners on several threads share the value, so it must be `Sync` as well
unsafe impl<T: ?Sized + Send + Sync> Send for RcBox<T, Synchronized> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RcBox<T, Synchronized> {}

/// Release function for a single `T`
unsafe fn drop_value<T>(payload: NonNull<u8>) {
    ptr::drop_in_place(payload.cast::<T>().as_ptr());
}

/// Release function for `[T]`, the length is kept in the header
unsafe fn drop_slice<T>(payload: NonNull<u8>) {
    let len = block::header(payload).len;
    let elements = ptr::slice_from_raw_parts_mut(payload.cast::<T>().as_ptr(), len);
    ptr::drop_in_place(elements);
}

fn unwrap_alloc<T>(result: Result<T, AllocError>) -> T {
    match result {
        Ok(value) => value,
        Err(AllocError::OutOfMemory { layout }) => handle_alloc_error(layout),
        Err(err @ AllocError::CapacityOverflow) => panic!("{err}"),
    }
}

// Private methods
impl<T: ?Sized, O: MemoryOrdering> RcBox<T, O> {
    fn from_handle(ptr: RawHandle) -> Self {
        Self {
            ptr,
            marker: PhantomData,
        }
    }

    fn header(&self) -> &Header {
        // SAFETY: The block is alive for as long as this owner is
        unsafe { block::header(self.ptr) }
    }
}

impl<T> RcBox<T> {
    /**
    Move `value` into a new block with a single owner

    Aborts through [`handle_alloc_error`] if the allocation fails, use
    [`try_new`](Self::try_new) to handle that instead.

    ```
    # use rcblock::RcBox;
    #
    let rc = RcBox::new(5);
    assert_eq!(*rc, 5);
    assert_eq!(RcBox::count(&rc), 1);
    ```
    */
    pub fn new(value: T) -> Self {
        Self::new_in(value, Synchronized)
    }

    /// Move `value` into a new block, returning an error if there is no memory for it
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Self::try_new_in(value, Synchronized)
    }

    /**
    Move `value` into a new block that is finalized by `release` instead of being dropped

    ```
    # use std::ptr::NonNull;
    # use rcblock::RcBox;
    #
    unsafe fn close(payload: NonNull<u8>) {
        let fd = payload.cast::<i32>().as_ptr().read();
        println!("closing {fd}");
    }

    let rc = unsafe { RcBox::new_with_release(3, close) };
    drop(rc);
    ```

    # Safety
    `release` is called once with a pointer to the value, and takes over the
    responsibility of dropping it (leaking it is fine). It must not free the
    memory itself.
    */
    pub unsafe fn new_with_release(value: T, release: ReleaseFn) -> Self {
        Self::new_with_release_in(value, release, Synchronized)
    }
}

impl<T, O: MemoryOrdering> RcBox<T, O> {
    /**
    Like [`new`](RcBox::new), with an explicit ordering policy

    ```
    # use rcblock::{ordering::Relaxed, RcBox};
    #
    let rc = RcBox::new_in(5, Relaxed);
    let other = RcBox::clone(&rc);
    assert_eq!(RcBox::count(&other), 2);
    ```
    */
    pub fn new_in(value: T, ordering: O) -> Self {
        unwrap_alloc(Self::try_new_in(value, ordering))
    }

    /// Like [`try_new`](RcBox::try_new), with an explicit ordering policy
    pub fn try_new_in(value: T, ordering: O) -> Result<Self, AllocError> {
        let release: ReleaseFn = if mem::needs_drop::<T>() {
            drop_value::<T>
        } else {
            raw::release_nothing
        };

        // SAFETY: The release function drops exactly one `T`
        unsafe { Self::try_new_with_release_in(value, release, ordering) }
    }

    /// Like [`new_with_release`](RcBox::new_with_release), with an explicit ordering policy
    ///
    /// # Safety
    /// See [`new_with_release`](RcBox::new_with_release)
    pub unsafe fn new_with_release_in(value: T, release: ReleaseFn, ordering: O) -> Self {
        unwrap_alloc(Self::try_new_with_release_in(value, release, ordering))
    }

    /// Fallible version of [`new_with_release_in`](Self::new_with_release_in)
    ///
    /// # Safety
    /// See [`new_with_release`](RcBox::new_with_release)
    pub unsafe fn try_new_with_release_in(
        value: T,
        release: ReleaseFn,
        _ordering: O,
    ) -> Result<Self, AllocError> {
        let ptr = block::allocate(Layout::new::<T>(), 1, release)?;
        ptr.cast::<T>().as_ptr().write(value);
        Ok(Self::from_handle(ptr))
    }

    /**
    Mutable access to the value, if this is its only owner

    ```
    # use rcblock::RcBox;
    #
    let mut rc = RcBox::new(1);
    *RcBox::get_mut(&mut rc).unwrap() += 1;

    let other = RcBox::clone(&rc);
    assert!(RcBox::get_mut(&mut rc).is_none());
    assert_eq!(*other, 2);
    ```
    */
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        // Acquire so that whatever former owners did is visible here
        if this.header().count.load(Ordering::Acquire) != 1 {
            return None;
        }

        // SAFETY: We are the only owner, and we hold the only reference to it
        Some(unsafe { &mut *this.ptr.cast::<T>().as_ptr() })
    }
}

impl<T> RcBox<[T]> {
    /**
    Allocate `n` default-initialized elements in one block

    ```
    # use rcblock::RcBox;
    #
    let array: RcBox<[u32]> = RcBox::new_array(5);
    assert_eq!(*array, [0; 5]);
    ```
    */
    pub fn new_array(n: usize) -> Self
    where
        T: Default,
    {
        Self::from_fn(n, |_| T::default())
    }

    /**
    Allocate `n` elements in one block, the `i`th set to `f(i)`

    ```
    # use rcblock::RcBox;
    #
    let array: RcBox<[usize]> = RcBox::from_fn(5, |i| i * 10);
    assert_eq!(*array, [0, 10, 20, 30, 40]);
    ```
    */
    pub fn from_fn(n: usize, f: impl FnMut(usize) -> T) -> Self {
        Self::from_fn_in(n, f, Synchronized)
    }

    /// Fallible version of [`from_fn`](Self::from_fn)
    pub fn try_from_fn(n: usize, f: impl FnMut(usize) -> T) -> Result<Self, AllocError> {
        Self::try_from_fn_in(n, f, Synchronized)
    }
}

impl<T, O: MemoryOrdering> RcBox<[T], O> {
    /// Like [`from_fn`](RcBox::from_fn), with an explicit ordering policy
    pub fn from_fn_in(n: usize, f: impl FnMut(usize) -> T, ordering: O) -> Self {
        unwrap_alloc(Self::try_from_fn_in(n, f, ordering))
    }

    /// Fallible version of [`from_fn_in`](Self::from_fn_in)
    ///
    /// If `f` panics the elements built so far are dropped and the block is freed.
    pub fn try_from_fn_in(
        n: usize,
        mut f: impl FnMut(usize) -> T,
        _ordering: O,
    ) -> Result<Self, AllocError> {
        let layout = Layout::array::<T>(n).map_err(|_| AllocError::CapacityOverflow)?;
        let release: ReleaseFn = if mem::needs_drop::<T>() {
            drop_slice::<T>
        } else {
            raw::release_nothing
        };

        let ptr = block::allocate(layout, n, release)?;
        let mut guard = PartialArray::<T> {
            ptr,
            initialized: 0,
            marker: PhantomData,
        };

        let elements = ptr.cast::<T>().as_ptr();
        while guard.initialized < n {
            let value = f(guard.initialized);
            // SAFETY: In bounds of the n elements allocated
            unsafe { elements.add(guard.initialized).write(value) };
            guard.initialized += 1;
        }

        mem::forget(guard);
        Ok(Self::from_handle(ptr))
    }
}

/// Cleans up a block whose elements are still being initialized
struct PartialArray<T> {
    ptr: RawHandle,
    initialized: usize,
    marker: PhantomData<T>,
}

impl<T> Drop for PartialArray<T> {
    fn drop(&mut self) {
        let first = self.ptr.cast::<T>().as_ptr();
        let elements = ptr::slice_from_raw_parts_mut(first, self.initialized);

        // SAFETY:
        // - Exactly the first `initialized` elements were written
        // - The block never left this function, so noone else can see it
        unsafe {
            ptr::drop_in_place(elements);
            block::free(self.ptr);
        }
    }
}

impl<T: ?Sized, O: MemoryOrdering> RcBox<T, O> {
    /// Number of owners of the value
    pub fn count(this: &Self) -> usize {
        this.header().count.load(O::LOAD)
    }

    /// Whether both handles own the same block
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Address of the value, which is also the raw handle of the block
    pub fn as_ptr(this: &Self) -> RawHandle {
        this.ptr
    }

    /// Snapshot of the block for debugging
    pub fn describe(this: &Self) -> BlockInfo {
        // SAFETY: The block is alive for as long as this owner is
        unsafe { diagnostics::describe_with::<O>(Some(this.ptr)) }
    }

    /// Run the heuristic validity check on the block
    ///
    /// This only fails if the block has been corrupted through unsafe code.
    pub fn is_valid(this: &Self) -> bool {
        // SAFETY: The header in front of the value is always readable
        unsafe { raw::is_valid(Some(this.ptr)) }
    }

    /**
    Add an owner, unless the block fails the validity check

    On failure an error is logged, the block is left alone, and `None` is returned.

    ```
    # use rcblock::RcBox;
    #
    let rc = RcBox::new([1, 2, 3]);
    let other = RcBox::clone_checked(&rc).unwrap();
    assert_eq!(RcBox::count(&rc), 2);
    ```
    */
    pub fn clone_checked(this: &Self) -> Option<Self> {
        if !Self::is_valid(this) {
            log::error!("RcBox::clone_checked: invalid block {:p}, not cloning", this.ptr);
            return None;
        }
        Some(Self::clone(this))
    }

    /**
    Drop this owner, unless the block fails the validity check

    On failure an error is logged, the handle is leaked without touching the
    block, and `false` is returned.
    */
    pub fn drop_checked(this: Self) -> bool {
        if !Self::is_valid(&this) {
            log::error!("RcBox::drop_checked: invalid block {:p}, not dropping", this.ptr);
            mem::forget(this);
            return false;
        }
        mem::drop(this);
        true
    }

    /**
    Give up the handle without dropping the ownership it represents

    ```
    # use rcblock::{raw, RcBox};
    #
    let rc = RcBox::new(10);
    let handle = RcBox::into_raw(rc);
    assert_eq!(unsafe { raw::get_count(Some(handle)) }, 1);

    let rc: RcBox<i32> = unsafe { RcBox::from_raw(handle) };
    assert_eq!(*rc, 10);
    ```
    */
    pub fn into_raw(this: Self) -> RawHandle {
        ManuallyDrop::new(this).ptr
    }

    /// Take over one ownership of a block
    ///
    /// # Safety
    /// - `ptr` must have come from [`RcBox::into_raw`] with the same `T`
    ///   (or a matching [`raw`](crate::raw) allocation holding an initialized `T`)
    /// - The caller must own one count of the block, which is handed over
    pub unsafe fn from_raw(ptr: RawHandle) -> Self {
        Self::from_handle(ptr)
    }
}

impl<T: ?Sized, O: MemoryOrdering> Clone for RcBox<T, O> {
    fn clone(&self) -> Self {
        let old = self.header().count.fetch_add(1, O::INCREMENT);

        // Same as `Arc`, the count must never wrap while owners are alive
        if old > isize::MAX as usize {
            std::process::abort();
        }

        Self::from_handle(self.ptr)
    }
}

impl<T: ?Sized, O: MemoryOrdering> Drop for RcBox<T, O> {
    fn drop(&mut self) {
        // SAFETY: This owner is alive, and gives up its count exactly once
        unsafe { raw::decrement_with::<O>(Some(self.ptr)) };
    }
}

impl<T, O: MemoryOrdering> Deref for RcBox<T, O> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The value is initialized and lives as long as this owner
        unsafe { self.ptr.cast::<T>().as_ref() }
    }
}

impl<T, O: MemoryOrdering> Deref for RcBox<[T], O> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        let len = self.header().len;
        // SAFETY: All `len` elements are initialized and live as long as this owner
        unsafe { slice::from_raw_parts(self.ptr.cast::<T>().as_ptr(), len) }
    }
}

impl<T> From<T> for RcBox<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized, O: MemoryOrdering> fmt::Debug for RcBox<T, O>
where
    Self: Deref,
    <Self as Deref>::Target: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
