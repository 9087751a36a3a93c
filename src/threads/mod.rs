// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Thread pool implementations.

#[cfg(feature = "rayon")]
mod rayon;
#[cfg(feature = "default-thread-pool")]
mod thread_pool;

use crate::core::task::Task;
#[cfg(feature = "rayon")]
pub use rayon::RayonThreadPool;
use std::num::NonZeroUsize;
#[cfg(feature = "default-thread-pool")]
pub use thread_pool::{CpuPinningPolicy, ThreadPool, ThreadPoolBuilder};

/// Scheduling priority requested for submitted work.
///
/// Backends without priority classes treat both values alike.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    /// Regular priority.
    #[default]
    Default,
    /// Work that a caller is actively waiting on.
    High,
}

/// Submission interface of a pool of worker threads.
///
/// This is the only way the [`Dispatcher`](crate::Dispatcher) reaches the
/// threads, so any pool implementing these operations can back it.
pub trait WorkerPool {
    /// Returns the number of workers in this pool.
    fn num_workers(&self) -> NonZeroUsize;

    /// Invokes `task` exactly once for each index in `0..num_tasks`, on at
    /// most [`num_workers()`](Self::num_workers) threads, and returns once all
    /// the invocations have completed.
    ///
    /// `num_tasks` must not exceed [`num_workers()`](Self::num_workers). If any
    /// invocation panics, this panics after all the invocations completed.
    fn run_across_workers(
        &self,
        num_tasks: usize,
        priority: Priority,
        task: &(dyn Fn(usize) + Sync),
    );

    /// Schedules `task` to run exactly once on some worker thread, without
    /// blocking the current thread.
    fn enqueue_one(&self, priority: Priority, task: Task);
}

impl<P: WorkerPool + ?Sized> WorkerPool for &P {
    fn num_workers(&self) -> NonZeroUsize {
        (**self).num_workers()
    }

    fn run_across_workers(
        &self,
        num_tasks: usize,
        priority: Priority,
        task: &(dyn Fn(usize) + Sync),
    ) {
        (**self).run_across_workers(num_tasks, priority, task)
    }

    fn enqueue_one(&self, priority: Priority, task: Task) {
        (**self).enqueue_one(priority, task)
    }
}
