// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

fn main() {
    divan::main();
}

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[10_000, 100_000, 1_000_000];
const NUM_JOBS: &[usize] = &[100, 1_000, 10_000];

/// Baseline benchmarks using serial iterators (without any multi-threading
/// involved).
mod serial {
    use super::LENGTHS;
    use divan::counter::BytesCount;
    use divan::{black_box, Bencher};

    #[divan::bench(args = LENGTHS)]
    fn sum(bencher: Bencher, len: usize) {
        let input = (0..len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        bencher
            .counter(BytesCount::of_many::<u64>(len))
            .bench_local(|| black_box(input_slice).iter().sum::<u64>())
    }
}

/// Benchmarks using Rayon.
mod rayon {
    use super::{LENGTHS, NUM_JOBS, NUM_THREADS};
    use divan::counter::{BytesCount, ItemsCount};
    use divan::{black_box, Bencher};
    use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    use std::sync::mpsc::channel;

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn sum_rayon<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let input = (0..len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()
            .unwrap();
        // Ideally we'd prefer to run bench_local() inside the Rayon thread pool, but
        // that doesn't work because divan::Bencher isn't Send (and bench_local()
        // consumes it).
        bencher
            .counter(BytesCount::of_many::<u64>(len))
            .bench_local(|| thread_pool.install(|| black_box(input_slice).par_iter().sum::<u64>()));
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_JOBS)]
    fn spawn_rayon<const NUM_THREADS: usize>(bencher: Bencher, num_jobs: usize) {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()
            .unwrap();
        bencher
            .counter(ItemsCount::new(num_jobs))
            .bench_local(|| {
                let (sender, receiver) = channel();
                for i in 0..num_jobs as u64 {
                    let sender = sender.clone();
                    thread_pool.spawn(move || sender.send(black_box(i)).unwrap());
                }
                drop(sender);
                receiver.iter().sum::<u64>()
            });
    }
}

/// Benchmarks using Sweater.
mod sweater {
    use super::{LENGTHS, NUM_JOBS, NUM_THREADS};
    use divan::counter::{BytesCount, ItemsCount};
    use divan::{black_box, Bencher};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use sweater::{
        CpuPinningPolicy, Dispatcher, ResultHandle, ThreadCount, ThreadPool, ThreadPoolBuilder,
    };

    fn dispatcher<const NUM_THREADS: usize>() -> Dispatcher<ThreadPool> {
        Dispatcher::new(
            ThreadPoolBuilder {
                num_threads: ThreadCount::try_from(NUM_THREADS).unwrap(),
                cpu_pinning: CpuPinningPolicy::IfSupported,
            }
            .build(),
        )
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn sum_spread<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let input = (0..len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        let dispatcher = dispatcher::<NUM_THREADS>();

        bencher
            .counter(BytesCount::of_many::<u64>(len))
            .bench_local(|| {
                let sum = AtomicU64::new(0);
                dispatcher.spread(len, |start, stop| {
                    let partial = black_box(input_slice)[start..stop].iter().sum::<u64>();
                    sum.fetch_add(partial, Ordering::Relaxed);
                });
                sum.into_inner()
            });
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_JOBS)]
    fn fire_and_forget_inline<const NUM_THREADS: usize>(bencher: Bencher, num_jobs: usize) {
        let dispatcher = dispatcher::<NUM_THREADS>();
        let counter: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));

        bencher
            .counter(ItemsCount::new(num_jobs))
            .bench_local(|| {
                let target = counter.load(Ordering::Relaxed) + num_jobs;
                for _ in 0..num_jobs {
                    dispatcher.fire_and_forget(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                while counter.load(Ordering::Acquire) < target {
                    std::hint::spin_loop();
                }
            });
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_JOBS)]
    fn fire_and_forget_heap<const NUM_THREADS: usize>(bencher: Bencher, num_jobs: usize) {
        let dispatcher = dispatcher::<NUM_THREADS>();
        let counter = Arc::new(AtomicUsize::new(0));

        bencher
            .counter(ItemsCount::new(num_jobs))
            .bench_local(|| {
                let target = counter.load(Ordering::Relaxed) + num_jobs;
                for _ in 0..num_jobs {
                    let counter = counter.clone();
                    dispatcher.fire_and_forget(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                while counter.load(Ordering::Acquire) < target {
                    std::hint::spin_loop();
                }
            });
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_JOBS)]
    fn dispatch<const NUM_THREADS: usize>(bencher: Bencher, num_jobs: usize) {
        let dispatcher = dispatcher::<NUM_THREADS>();

        bencher
            .counter(ItemsCount::new(num_jobs))
            .bench_local(|| {
                (0..num_jobs as u64)
                    .map(|i| dispatcher.dispatch(move || black_box(i)))
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(ResultHandle::join)
                    .sum::<u64>()
            });
    }
}
