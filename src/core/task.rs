// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transport of fire-and-forget work to a worker thread.
//!
//! Small closures are carried by value inside the [`Task`] itself, larger ones
//! are boxed. Both variants implement [`Runnable`], so backends run a task
//! without knowing how it was stored.

use std::mem::{align_of, needs_drop, size_of, MaybeUninit};

/// A unit of work that runs exactly once.
pub trait Runnable: Send + 'static {
    /// Runs the work, consuming it.
    fn run(self);
}

/// Returns whether a closure of type `F` can be carried inline, i.e. stored in
/// one pointer-sized word without any drop glue.
pub const fn fits_inline<F>() -> bool {
    size_of::<F>() <= size_of::<usize>()
        && align_of::<F>() <= align_of::<usize>()
        && !needs_drop::<F>()
}

/// A closure stored by value in a single pointer-sized word, next to the
/// monomorphized function that knows how to call it.
pub struct InlineTask {
    /// Bytes of the closure. Only the first `size_of::<F>()` bytes are
    /// initialized.
    storage: MaybeUninit<usize>,
    /// Reads the closure back from `storage` and calls it.
    call: unsafe fn(MaybeUninit<usize>),
}

impl InlineTask {
    /// Stores the given closure inline, or hands it back if it doesn't
    /// [fit](fits_inline).
    pub fn try_new<F: FnOnce() + Send + 'static>(work: F) -> Result<Self, F> {
        if !fits_inline::<F>() {
            return Err(work);
        }
        let mut storage = MaybeUninit::<usize>::uninit();
        // SAFETY: `F` fits in a `usize` in both size and alignment, as checked
        // above, so the write stays in bounds and is properly aligned.
        unsafe { storage.as_mut_ptr().cast::<F>().write(work) };
        Ok(Self {
            storage,
            call: call_inline::<F>,
        })
    }
}

/// Calls a closure of type `F` previously written at the start of `storage`.
///
/// # Safety
///
/// `storage` must have been initialized by [`InlineTask::try_new::<F>()`], and
/// the value must not be read again afterwards.
unsafe fn call_inline<F: FnOnce()>(storage: MaybeUninit<usize>) {
    // SAFETY: Ensured by the caller, a valid `F` is stored at the start of
    // `storage`, with a compatible size and alignment.
    let work = unsafe { storage.as_ptr().cast::<F>().read() };
    work()
}

impl Runnable for InlineTask {
    fn run(self) {
        // SAFETY: `call` and `storage` were set together by `try_new()`, and
        // `self` is consumed here so the closure is read only once. Dropping an
        // `InlineTask` without running it is fine since the stored closure has
        // no drop glue.
        unsafe { (self.call)(self.storage) }
    }
}

/// A closure moved to the heap, freed right after it runs.
pub struct HeapTask(Box<dyn FnOnce() + Send + 'static>);

impl HeapTask {
    /// Moves the given closure to the heap.
    pub fn new<F: FnOnce() + Send + 'static>(work: F) -> Self {
        Self(Box::new(work))
    }
}

impl Runnable for HeapTask {
    fn run(self) {
        (self.0)()
    }
}

/// A fire-and-forget unit of work, as submitted to a
/// [`WorkerPool`](crate::threads::WorkerPool).
pub enum Task {
    /// The closure is carried by value, without any allocation.
    Inline(InlineTask),
    /// The closure is boxed.
    Heap(HeapTask),
}

impl Task {
    /// Wraps the given closure, choosing the inline transport whenever
    /// possible.
    pub fn new<F: FnOnce() + Send + 'static>(work: F) -> Self {
        match InlineTask::try_new(work) {
            Ok(inline) => Task::Inline(inline),
            Err(work) => Task::Heap(HeapTask::new(work)),
        }
    }

    /// Returns whether this task is carried inline.
    pub fn is_inline(&self) -> bool {
        matches!(self, Task::Inline(_))
    }
}

impl Runnable for Task {
    fn run(self) {
        match self {
            Task::Inline(task) => task.run(),
            Task::Heap(task) => task.run(),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Inline(_) => f.write_str("Task::Inline"),
            Task::Heap(_) => f.write_str("Task::Heap"),
        }
    }
}
