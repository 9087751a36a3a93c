// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of parallel work.

use clap::{Parser, ValueEnum};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use sweater::{CpuPinningPolicy, DispatchError, Dispatcher, ThreadCount, ThreadPoolBuilder};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let dispatcher = Dispatcher::new(
        ThreadPoolBuilder {
            num_threads: match cli.num_threads {
                Some(num_threads) => ThreadCount::Count(num_threads),
                None => ThreadCount::AvailableParallelism,
            },
            cpu_pinning: match cli.cpu_pinning {
                CpuPinningCli::No => CpuPinningPolicy::No,
                CpuPinningCli::IfSupported => CpuPinningPolicy::IfSupported,
                CpuPinningCli::Always => CpuPinningPolicy::Always,
            },
        }
        .build(),
    );
    println!(
        "running on {} workers (hardware concurrency = {})",
        dispatcher.number_of_workers(),
        sweater::number_of_workers()
    );

    match cli.scenario {
        Scenario::Sum => {
            let input = (0..cli.input_size).collect::<Vec<u64>>();
            let input_slice = input.as_slice();
            let sum = AtomicU64::new(0);
            dispatcher.spread(input_slice.len(), |start, stop| {
                let partial = black_box(input_slice)[start..stop].iter().sum::<u64>();
                sum.fetch_add(partial, Ordering::Relaxed);
            });
            println!("sum = {}", sum.into_inner());
        }
        Scenario::FindFirst => {
            let input = fill_needles(cli.input_size as usize, cli.density);
            let input_slice = input.as_slice();
            let first = AtomicUsize::new(usize::MAX);
            dispatcher.spread(input_slice.len(), |start, stop| {
                if let Some(i) = black_box(input_slice)[start..stop].iter().position(|x| *x) {
                    first.fetch_min(start + i, Ordering::Relaxed);
                }
            });
            let found = Some(first.into_inner()).filter(|&i| i != usize::MAX);
            println!("found = {found:?}");
        }
        Scenario::FireAndForget => {
            let (sender, receiver) = channel();
            for i in 0..cli.input_size {
                let sender = sender.clone();
                dispatcher.fire_and_forget(move || {
                    // Nobody observes the outcome: report it through a channel.
                    let _ = sender.send(black_box(i) * 2);
                });
            }
            drop(sender);
            let total = receiver.iter().sum::<u64>();
            println!("fire-and-forget total = {total}");
        }
        Scenario::Dispatch => {
            let handles = (0..cli.input_size)
                .map(|i| {
                    dispatcher.dispatch(move || {
                        if cli.panic_every != 0 && i % cli.panic_every == 0 {
                            panic!("refusing to process {i}");
                        }
                        i * i
                    })
                })
                .collect::<Vec<_>>();

            let mut total = 0u64;
            let mut failures = 0usize;
            for handle in handles {
                match handle.get() {
                    Ok(value) => total += value,
                    Err(DispatchError::Panicked(_)) => failures += 1,
                    Err(e @ DispatchError::Abandoned) => eprintln!("{e}"),
                }
            }
            println!("dispatch total = {total}, {failures} task(s) panicked");
        }
    }
}

/// Creates a vector of `input_size` booleans, `density` of which are set to
/// [`true`] (the needles). The set of needles follows a uniform distribution,
/// but is fixed by a constant-time seed for reproducibility.
fn fill_needles(input_size: usize, density: usize) -> Vec<bool> {
    let mut input = vec![false; input_size];

    let mut rng = ChaCha12Rng::seed_from_u64(42);
    let needles = index::sample(&mut rng, input_size, density);
    for needle in needles {
        input[needle] = true;
    }

    input
}

/// CLI tool to run examples of parallel work.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Policy to pin worker threads to CPUs.
    #[arg(long, value_enum, default_value_t = CpuPinningCli::IfSupported)]
    cpu_pinning: CpuPinningCli,

    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items in the input, or number of tasks to submit.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,

    /// Density of items that match the search. Used only for the find-first
    /// scenario.
    #[arg(long, default_value_t = 1)]
    density: usize,

    /// Make one dispatched task in this many panic (0 for none). Used only for
    /// the dispatch scenario.
    #[arg(long, default_value_t = 0)]
    panic_every: u64,
}

/// Policy to pin worker threads to CPUs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CpuPinningCli {
    /// Don't pin worker threads.
    No,
    /// Pin worker threads if the platform supports it.
    IfSupported,
    /// Pin worker threads, failing if the platform doesn't support it.
    Always,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Sum a slice of numbers with a parallel-for.
    Sum,
    /// Find the first needle with a parallel-for.
    FindFirst,
    /// Submit one fire-and-forget task per input item.
    FireAndForget,
    /// Submit one dispatched task per input item and collect the results.
    Dispatch,
}
