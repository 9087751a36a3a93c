// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Even splitting of an iteration space among workers.

use std::num::NonZeroUsize;

/// A plan splitting `0..iterations` into contiguous ranges, one per worker.
///
/// Each worker receives either `base` or `base + 1` iterations, where
/// `base = iterations / workers`. The `iterations % workers` remainder
/// iterations go to the first workers, so the ranges are ordered by worker
/// index and tile `0..iterations` without gaps nor overlaps.
///
/// When there are fewer iterations than workers, only the first
/// [`num_tasks()`](Self::num_tasks) workers have something to do: callers must
/// not invoke the other workers at all, rather than hand them an empty range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Total number of iterations to split.
    iterations: usize,
    /// Number of iterations that every task receives.
    base: usize,
    /// Number of leading tasks that receive one extra iteration.
    extra: usize,
    /// Number of tasks with a non-empty range.
    num_tasks: usize,
}

impl Partition {
    /// Creates a plan splitting `0..iterations` among the given number of
    /// workers.
    pub fn new(iterations: usize, workers: NonZeroUsize) -> Self {
        let workers: usize = workers.into();
        Self {
            iterations,
            base: iterations / workers,
            extra: iterations % workers,
            num_tasks: workers.min(iterations),
        }
    }

    /// Returns the total number of iterations covered by this plan.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Returns the number of workers that receive a non-empty range, i.e.
    /// `min(workers, iterations)`.
    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    /// Returns the range of iterations assigned to the given worker.
    ///
    /// The worker index must be lower than [`num_tasks()`](Self::num_tasks).
    pub fn range(&self, worker_index: usize) -> std::ops::Range<usize> {
        debug_assert!(
            worker_index < self.num_tasks,
            "worker #{worker_index} has no work to do: only {} tasks in this partition",
            self.num_tasks
        );
        let extra_iters = worker_index.min(self.extra);
        let plain_iters = worker_index - extra_iters;
        let has_extra_iter = usize::from(worker_index < self.extra);

        let start = extra_iters * (self.base + 1) + plain_iters * self.base;
        let stop = start + self.base + has_extra_iter;
        debug_assert!(stop <= self.iterations);
        debug_assert!(start < stop);
        start..stop
    }

    /// Returns an iterator over the non-empty ranges, in worker order.
    pub fn ranges(&self) -> impl ExactSizeIterator<Item = std::ops::Range<usize>> + '_ {
        (0..self.num_tasks).map(move |i| self.range(i))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn partition(iterations: usize, workers: usize) -> Partition {
        Partition::new(iterations, NonZeroUsize::try_from(workers).unwrap())
    }

    #[test]
    fn test_partition_splits_evenly() {
        let plan = partition(200, 4);
        assert_eq!(
            plan.ranges().collect::<Vec<_>>(),
            [0..50, 50..100, 100..150, 150..200]
        );
    }

    #[test]
    fn test_partition_extra_iterations_go_first() {
        let plan = partition(10, 3);
        assert_eq!(plan.num_tasks(), 3);
        assert_eq!(plan.ranges().collect::<Vec<_>>(), [0..4, 4..7, 7..10]);

        let plan = partition(100, 7);
        assert_eq!(
            plan.ranges().collect::<Vec<_>>(),
            [0..15, 15..30, 30..44, 44..58, 58..72, 72..86, 86..100]
        );
    }

    #[test]
    fn test_partition_fewer_iterations_than_workers() {
        let plan = partition(3, 8);
        assert_eq!(plan.num_tasks(), 3);
        assert_eq!(plan.ranges().collect::<Vec<_>>(), [0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_partition_zero_iterations() {
        let plan = partition(0, 4);
        assert_eq!(plan.num_tasks(), 0);
        assert_eq!(plan.ranges().count(), 0);
    }

    #[test]
    fn test_partition_single_worker() {
        let plan = partition(1234, 1);
        assert_eq!(plan.ranges().collect::<Vec<_>>(), [0..1234]);
    }

    #[test]
    fn test_partition_tiles_exactly() {
        for workers in 1..=17 {
            for iterations in 0..=200 {
                let plan = partition(iterations, workers);
                assert_eq!(plan.num_tasks(), workers.min(iterations));

                let mut next = 0;
                let mut min_len = usize::MAX;
                let mut max_len = 0;
                for range in plan.ranges() {
                    assert_eq!(range.start, next);
                    assert!(range.start < range.end);
                    next = range.end;
                    min_len = min_len.min(range.len());
                    max_len = max_len.max(range.len());
                }
                assert_eq!(next, iterations);
                if iterations != 0 {
                    assert!(max_len - min_len <= 1);
                }
            }
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic = "worker #2 has no work to do: only 2 tasks in this partition"]
    fn test_partition_idle_worker() {
        partition(2, 4).range(2);
    }
}
