// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool with one OS thread per worker.

use super::{Priority, WorkerPool};
use crate::core::sync::{make_lending_group, Borrower, Injector, Lender, WorkerState};
use crate::core::task::Task;
use crate::core::workers::ThreadCount;
use crate::macros::{log_debug, log_error, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
#[derive(Clone, Copy, Debug)]
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for ThreadPoolBuilder {
    /// One unpinned thread per hardware execution context.
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use sweater::{CpuPinningPolicy, Dispatcher, ThreadCount, ThreadPoolBuilder};
    /// let pool_builder = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// };
    /// let dispatcher = Dispatcher::new(pool_builder.build());
    ///
    /// let squares = dispatcher.dispatch(|| (1..=10).map(|x| x * x).sum::<i32>());
    /// assert_eq!(squares.get().unwrap(), 385);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the number of threads exceeds
    /// [`MAX_HARDWARE_CONCURRENCY`](crate::MAX_HARDWARE_CONCURRENCY), if a
    /// thread cannot be spawned, or if CPU pinning is
    /// [required](CpuPinningPolicy::Always) but unavailable.
    pub fn build(&self) -> ThreadPool {
        ThreadPool::new(self)
    }
}

/// A thread pool whose threads serve both fan-out rounds (one call per worker
/// index, waited for by the submitter) and a queue of fire-and-forget tasks.
///
/// Fan-out rounds take precedence over queued tasks, and queued
/// [`Priority::High`] tasks over [`Priority::Default`] ones. Only one fan-out
/// round runs at a time: concurrent callers of
/// [`run_across_workers()`](WorkerPool::run_across_workers) are serialized,
/// and a call issued from one of the pool's own threads runs all the indices
/// serially on that thread.
///
/// Dropping the pool runs the remaining queued tasks, then joins the threads.
pub struct ThreadPool {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
    /// Side lending fan-out tasks to the worker threads.
    lender: Mutex<Lender>,
    /// Side queuing fire-and-forget tasks.
    injector: Injector,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Self {
        let num_threads: usize = builder.num_threads.count().into();
        let cpu_pinning = builder.cpu_pinning;
        let (lender, injector, borrowers) = make_lending_group(num_threads);

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let threads = borrowers
            .into_iter()
            .enumerate()
            .map(|(id, borrower)| {
                let mut context = ThreadContext {
                    #[cfg(feature = "log")]
                    id,
                    borrower,
                };
                let handle = std::thread::Builder::new()
                    .name(format!("sweater-worker-{id}"))
                    .spawn(move || {
                        pin_current_thread(id, cpu_pinning);
                        context.run()
                    })
                    .unwrap_or_else(|e| panic!("Failed to spawn worker thread #{id}: {e}"));
                WorkerThreadHandle { handle }
            })
            .collect();
        log_debug!("[main thread] Spawned {num_threads} threads");

        Self {
            threads,
            lender: Mutex::new(lender),
            injector,
        }
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.threads.len().try_into().unwrap()
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        ThreadPoolBuilder::default().build()
    }
}

impl WorkerPool for ThreadPool {
    fn num_workers(&self) -> NonZeroUsize {
        self.num_threads()
    }

    fn run_across_workers(
        &self,
        num_tasks: usize,
        _priority: Priority,
        task: &(dyn Fn(usize) + Sync),
    ) {
        assert!(
            num_tasks <= self.threads.len(),
            "cannot fan out {num_tasks} tasks over {} worker threads",
            self.threads.len()
        );
        if num_tasks == 0 {
            return;
        }

        if self.injector.is_borrower_thread() {
            log_debug!("Fanning out from a worker thread, running {num_tasks} tasks serially");
            (0..num_tasks).for_each(task);
            return;
        }

        // A poisoned lock only means that a previous round re-raised a worker
        // panic, after the lender was left ready for the next round.
        let mut lender = self.lender.lock().unwrap_or_else(PoisonError::into_inner);
        lender.lend(num_tasks, task);
    }

    fn enqueue_one(&self, priority: Priority, task: Task) {
        self.injector.push(priority, task);
    }
}

impl Drop for ThreadPool {
    /// Joins all the threads in the pool.
    ///
    /// If the pool is dropped by a task running on one of its own threads,
    /// that thread is detached instead: it exits on its own once the task
    /// returns and the queue is drained.
    #[allow(clippy::single_match, clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        self.injector.finish_workers();

        let current = std::thread::current().id();
        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            if t.handle.thread().id() == current {
                log_debug!("[thread {_i}] Dropping the pool from its own thread, detaching it");
                continue;
            }
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");
    }
}

/// Applies the CPU pinning policy to the current worker thread.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            match cpu_set
                .set(id)
                .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpu_set))
            {
                Ok(()) => log_debug!("Pinned thread #{id} to CPU #{id}"),
                Err(_e) => log_warn!("Failed to set CPU affinity for thread #{id}: {_e}"),
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set
                .set(id)
                .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpu_set))
            {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            }
            log_debug!("Pinned thread #{id} to CPU #{id}");
        }
    }
}

/// CPU pinning isn't implemented on this platform, which was reported when
/// building the pool.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: usize, _cpu_pinning: CpuPinningPolicy) {}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Thread index.
    #[cfg(feature = "log")]
    id: usize,
    /// Synchronization with the main side of the pool.
    borrower: Borrower,
}

impl ThreadContext {
    /// Main function run by this thread.
    fn run(&mut self) {
        self.borrower.register_current_thread();
        while let WorkerState::Ready = self.borrower.step() {}
        log_debug!("[thread {}] Exiting", self.id);
    }
}
