// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Front end distributing work over a [`WorkerPool`].

use super::promise::{channel, ResultHandle};
use super::range::Partition;
use super::task::Task;
use super::workers::check_ceiling;
use crate::macros::{log_debug, log_trace};
use crate::threads::{Priority, WorkerPool};
use std::num::NonZeroUsize;

/// Distributes work over the workers of a [`WorkerPool`].
///
/// ```
/// # use sweater::{CpuPinningPolicy, Dispatcher, ThreadCount, ThreadPoolBuilder};
/// # use std::sync::atomic::{AtomicU64, Ordering};
/// let dispatcher = Dispatcher::new(
///     ThreadPoolBuilder {
///         num_threads: ThreadCount::try_from(4).unwrap(),
///         cpu_pinning: CpuPinningPolicy::No,
///     }
///     .build(),
/// );
///
/// // Parallel-for: each worker sums its own chunk.
/// let input = (1..=1000).collect::<Vec<u64>>();
/// let sum = AtomicU64::new(0);
/// dispatcher.spread(input.len(), |start, stop| {
///     let partial = input[start..stop].iter().sum::<u64>();
///     sum.fetch_add(partial, Ordering::Relaxed);
/// });
/// assert_eq!(sum.into_inner(), 500_500);
///
/// // Asynchronous work with a result.
/// let answer = dispatcher.dispatch(|| 6 * 7);
/// assert_eq!(answer.get().unwrap(), 42);
/// ```
pub struct Dispatcher<P> {
    /// Backend running the work.
    pool: P,
    /// Number of workers of the backend, cached at construction.
    workers: NonZeroUsize,
}

impl<P: WorkerPool> Dispatcher<P> {
    /// Creates a dispatcher over the given pool.
    ///
    /// # Panics
    ///
    /// Panics if the pool has more workers than
    /// [`MAX_HARDWARE_CONCURRENCY`](crate::MAX_HARDWARE_CONCURRENCY).
    pub fn new(pool: P) -> Self {
        let workers = pool.num_workers();
        check_ceiling(workers);
        log_debug!("Created a dispatcher over {workers} workers");
        Self { pool, workers }
    }

    /// Returns the number of workers that work is distributed to.
    pub fn number_of_workers(&self) -> NonZeroUsize {
        self.workers
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Splits `0..iterations` into one contiguous range per worker, calls
    /// `work(start, stop)` on each non-empty range in parallel, and waits for
    /// all of them to complete.
    ///
    /// Range sizes differ by at most one iteration. With fewer iterations than
    /// workers, each call receives a single iteration, and with zero
    /// iterations `work` isn't called at all.
    ///
    /// `work` is expected not to panic. If it does, this function panics once
    /// all the other calls have completed.
    pub fn spread(&self, iterations: usize, work: impl Fn(usize, usize) + Sync) {
        let partition = Partition::new(iterations, self.workers);
        let num_tasks = partition.num_tasks();
        if num_tasks == 0 {
            return;
        }
        log_trace!("Spreading {iterations} iterations over {num_tasks} workers");

        self.pool
            .run_across_workers(num_tasks, Priority::High, &|worker_index| {
                let range = partition.range(worker_index);
                log_trace!("[worker {worker_index}] Processing range {range:?}");
                work(range.start, range.end)
            });
    }

    /// Schedules `work` to run once on some worker, without waiting for it nor
    /// reporting its completion.
    ///
    /// Closures small enough to fit in a pointer and without drop glue are
    /// submitted without allocating.
    ///
    /// `work` is expected not to panic: nothing would observe the panic.
    pub fn fire_and_forget(&self, work: impl FnOnce() + Send + 'static) {
        let task = Task::new(work);
        log_trace!("Enqueuing {task:?}");
        self.pool.enqueue_one(Priority::High, task);
    }

    /// Schedules `work` to run once on some worker, returning a handle to
    /// retrieve its value (or its panic) later.
    ///
    /// The handle is returned without waiting for `work` to start, and may be
    /// dropped at any time.
    pub fn dispatch<R: Send + 'static>(
        &self,
        work: impl FnOnce() -> R + Send + 'static,
    ) -> ResultHandle<R> {
        let (promise, handle) = channel();
        self.fire_and_forget(move || promise.fulfill(work));
        handle
    }
}

impl<P: WorkerPool + Default> Default for Dispatcher<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}
