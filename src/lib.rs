// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod core;
mod macros;
pub mod threads;

pub use crate::core::dispatcher::Dispatcher;
pub use crate::core::promise::{DispatchError, PanicPayload, ResultHandle};
pub use crate::core::range::Partition;
pub use crate::core::task::{HeapTask, InlineTask, Runnable, Task};
pub use crate::core::workers::{number_of_workers, ThreadCount, MAX_HARDWARE_CONCURRENCY};
#[cfg(feature = "rayon")]
pub use threads::RayonThreadPool;
pub use threads::{Priority, WorkerPool};
#[cfg(feature = "default-thread-pool")]
pub use threads::{CpuPinningPolicy, ThreadPool, ThreadPoolBuilder};

/// Returns the process-wide dispatcher, spawning its thread pool on first use
/// with one unpinned thread per hardware execution context.
///
/// The pool lives until the process exits.
#[cfg(feature = "default-thread-pool")]
pub fn global() -> &'static Dispatcher<ThreadPool> {
    static GLOBAL: std::sync::OnceLock<Dispatcher<ThreadPool>> = std::sync::OnceLock::new();
    GLOBAL.get_or_init(Dispatcher::default)
}

/// Runs [`Dispatcher::spread()`] on the [`global()`] dispatcher.
///
/// ```
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// let visited = AtomicUsize::new(0);
/// sweater::spread(1000, |start, stop| {
///     visited.fetch_add(stop - start, Ordering::Relaxed);
/// });
/// assert_eq!(visited.into_inner(), 1000);
/// ```
#[cfg(feature = "default-thread-pool")]
pub fn spread(iterations: usize, work: impl Fn(usize, usize) + Sync) {
    global().spread(iterations, work)
}

/// Runs [`Dispatcher::fire_and_forget()`] on the [`global()`] dispatcher.
#[cfg(feature = "default-thread-pool")]
pub fn fire_and_forget(work: impl FnOnce() + Send + 'static) {
    global().fire_and_forget(work)
}

/// Runs [`Dispatcher::dispatch()`] on the [`global()`] dispatcher.
///
/// ```
/// let handle = sweater::dispatch(|| "hello".to_uppercase());
/// assert_eq!(handle.get().unwrap(), "HELLO");
/// ```
#[cfg(feature = "default-thread-pool")]
pub fn dispatch<R: Send + 'static>(work: impl FnOnce() -> R + Send + 'static) -> ResultHandle<R> {
    global().dispatch(work)
}
