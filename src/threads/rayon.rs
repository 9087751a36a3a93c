// Copyright 2025-2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Adaptors over Rayon thread pools.

use super::{Priority, WorkerPool};
use crate::core::task::{Runnable, Task};
use crate::macros::log_error;
use rayon_core::{Scope, ThreadPool};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Adaptor to distribute work over a thread pool provided by the
/// [Rayon](https://docs.rs/rayon) crate.
///
/// Fan-out calls are spawned in a Rayon scope, so each index may run on any
/// thread of the pool and the calling thread participates in the work if it
/// belongs to the pool. Nested fan-outs are therefore supported natively.
/// Rayon has no priority classes: [`Priority`] is ignored.
///
/// ```
/// # // TODO: Enable Miri once supported by Rayon and its dependencies: https://github.com/crossbeam-rs/crossbeam/issues/1181.
/// # #[cfg(not(miri))]
/// # {
/// # use sweater::{Dispatcher, RayonThreadPool};
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// let dispatcher = Dispatcher::new(RayonThreadPool::new_global());
///
/// let count = AtomicUsize::new(0);
/// dispatcher.spread(1000, |start, stop| {
///     count.fetch_add(stop - start, Ordering::Relaxed);
/// });
/// assert_eq!(count.into_inner(), 1000);
///
/// let answer = dispatcher.dispatch(|| 6 * 7);
/// assert_eq!(answer.join(), 42);
/// # }
/// ```
#[derive(Clone, Copy, Debug)]
pub struct RayonThreadPool<'a> {
    /// Handle to the Rayon thread pool, or [`None`] if using the global Rayon
    /// thread pool.
    thread_pool: Option<&'a ThreadPool>,
}

impl RayonThreadPool<'static> {
    /// Wraps [Rayon](https://docs.rs/rayon)'s global thread pool.
    ///
    /// Like Rayon's own free functions, this targets the pool of the calling
    /// thread when called from a thread of another Rayon pool, for example
    /// inside [`ThreadPool::install()`]. Both the number of workers and the
    /// work then refer to that pool.
    pub fn new_global() -> Self {
        Self { thread_pool: None }
    }
}

impl<'a> RayonThreadPool<'a> {
    /// Wraps a user-created [Rayon](https://docs.rs/rayon) thread pool.
    ///
    /// ```
    /// # // TODO: Enable Miri once supported by Rayon and its dependencies: https://github.com/crossbeam-rs/crossbeam/issues/1181.
    /// # #[cfg(not(miri))]
    /// # {
    /// # use sweater::{Dispatcher, RayonThreadPool};
    /// // Create a custom Rayon thread pool.
    /// let thread_pool = rayon_core::ThreadPoolBuilder::new()
    ///     .num_threads(3)
    ///     .build()
    ///     .unwrap();
    ///
    /// // Wrap it for use with a dispatcher.
    /// let dispatcher = Dispatcher::new(RayonThreadPool::new(&thread_pool));
    /// assert_eq!(dispatcher.number_of_workers().get(), 3);
    /// # }
    /// ```
    pub fn new(thread_pool: &'a ThreadPool) -> Self {
        Self {
            thread_pool: Some(thread_pool),
        }
    }

    /// Creates a fork-join scope on the underlying Rayon thread pool and
    /// invokes the closure with a reference to the scope.
    fn scope<'scope, OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce(&Scope<'scope>) -> R + Send,
        R: Send,
    {
        match self.thread_pool {
            None => rayon_core::scope(op),
            Some(thread_pool) => thread_pool.scope(op),
        }
    }
}

impl WorkerPool for RayonThreadPool<'_> {
    fn num_workers(&self) -> NonZeroUsize {
        let num_threads = match self.thread_pool {
            // Same pool as `rayon_core::scope()` and `rayon_core::spawn()`.
            None => rayon_core::current_num_threads(),
            Some(thread_pool) => thread_pool.current_num_threads(),
        };
        // Rayon pools always have at least one thread.
        NonZeroUsize::new(num_threads).unwrap_or(NonZeroUsize::MIN)
    }

    fn run_across_workers(
        &self,
        num_tasks: usize,
        _priority: Priority,
        task: &(dyn Fn(usize) + Sync),
    ) {
        if num_tasks == 0 {
            return;
        }
        // Rayon re-raises the first panic once the whole scope completed.
        self.scope(|scope| {
            for index in 0..num_tasks {
                scope.spawn(move |_| task(index));
            }
        });
    }

    fn enqueue_one(&self, _priority: Priority, task: Task) {
        // A panic escaping a spawned job would abort the process, unless the
        // Rayon pool was built with a panic handler.
        let job = move || {
            if let Err(_e) = catch_unwind(AssertUnwindSafe(|| task.run())) {
                log_error!("Fire-and-forget task panicked on a Rayon thread: {_e:?}");
            }
        };
        match self.thread_pool {
            None => rayon_core::spawn(job),
            Some(thread_pool) => thread_pool.spawn(job),
        }
    }
}
