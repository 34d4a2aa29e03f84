//! Memory ordering policies for the counter
//!
//! The counter itself is consistent under any policy: every thread agrees on the
//! order of increments and decrements, and exactly one decrement observes the
//! transition from one to zero. The policies differ in what the releasing
//! thread is guaranteed to see of the payload.
//!
//! | Policy           | increment | decrement | before release    | load    |
//! |------------------|-----------|-----------|-------------------|---------|
//! | [`Relaxed`]      | Relaxed   | Relaxed   | -                 | Relaxed |
//! | [`Synchronized`] | Relaxed   | Release   | `fence(Acquire)`  | Acquire |

use crate::sync::{fence, Ordering};

mod sealed {
    pub trait Sealed {}
}

/// Strategy deciding which atomic orderings the counting operations use
pub trait MemoryOrdering: sealed::Sealed {
    /// Used when adding an owner
    const INCREMENT: Ordering;

    /// Used when removing an owner
    const DECREMENT: Ordering;

    /// Used when reading the count
    const LOAD: Ordering;

    /// Runs on the thread that performed the final decrement, before the release function
    fn before_release();
}

/**
Relaxed ordering everywhere, including on the final decrement

Writes another owner made to the payload before letting go are not guaranteed
to be visible to the release function. Callers relying on that must add their
own synchronization.

Typed handles using this policy are not [`Send`], see [`RcBox`](crate::RcBox).
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Relaxed;

impl sealed::Sealed for Relaxed {}

impl MemoryOrdering for Relaxed {
    const INCREMENT: Ordering = Ordering::Relaxed;
    const DECREMENT: Ordering = Ordering::Relaxed;
    const LOAD: Ordering = Ordering::Relaxed;

    #[inline]
    fn before_release() {}
}

/**
Release on every decrement, and an acquire fence before the release function runs

Everything an owner did to the payload before dropping its handle happens-before
the release function. This is the default policy.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Synchronized;

impl sealed::Sealed for Synchronized {}

impl MemoryOrdering for Synchronized {
    const INCREMENT: Ordering = Ordering::Relaxed;
    const DECREMENT: Ordering = Ordering::Release;
    const LOAD: Ordering = Ordering::Acquire;

    #[inline]
    fn before_release() {
        fence(Ordering::Acquire);
    }
}
