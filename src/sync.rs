//! Atomics used by the block header, swapped for loom's when model checking

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{fence, AtomicUsize};

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{fence, AtomicUsize};

pub(crate) use std::sync::atomic::Ordering;
