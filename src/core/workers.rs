// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker-count oracle: how many hardware execution contexts this process can
//! use, measured once and validated against a compile-time ceiling.

use crate::macros::log_debug;
#[cfg(all(not(miri), any(target_os = "android", target_os = "linux")))]
use crate::macros::log_warn;
#[cfg(all(not(miri), any(target_os = "android", target_os = "linux")))]
use nix::unistd::{sysconf, SysconfVar};
use std::num::NonZeroUsize;
use std::sync::OnceLock;

/// Upper bound on the number of workers, configured at build time via the
/// `SWEATER_MAX_HARDWARE_CONCURRENCY` environment variable.
///
/// When set, neither the measured hardware concurrency nor an explicit
/// [`ThreadCount::Count`] may exceed it. Exceeding it indicates a
/// configuration defect and panics.
pub const MAX_HARDWARE_CONCURRENCY: Option<NonZeroUsize> =
    parse_ceiling(option_env!("SWEATER_MAX_HARDWARE_CONCURRENCY"));

/// Parses the ceiling at compile time. A malformed value fails the build.
const fn parse_ceiling(value: Option<&str>) -> Option<NonZeroUsize> {
    let bytes = match value {
        None => return None,
        Some(value) => value.as_bytes(),
    };
    if bytes.is_empty() {
        panic!("SWEATER_MAX_HARDWARE_CONCURRENCY must not be empty");
    }
    let mut result: usize = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if !digit.is_ascii_digit() {
            panic!("SWEATER_MAX_HARDWARE_CONCURRENCY must be a decimal integer");
        }
        result = match result.checked_mul(10) {
            Some(x) => match x.checked_add((digit - b'0') as usize) {
                Some(x) => x,
                None => panic!("SWEATER_MAX_HARDWARE_CONCURRENCY overflows usize"),
            },
            None => panic!("SWEATER_MAX_HARDWARE_CONCURRENCY overflows usize"),
        };
        i += 1;
    }
    match NonZeroUsize::new(result) {
        Some(ceiling) => Some(ceiling),
        None => panic!("SWEATER_MAX_HARDWARE_CONCURRENCY must be positive"),
    }
}

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn one thread per hardware execution context, as reported by
    /// [`number_of_workers()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    ///
    /// # Panics
    ///
    /// Panics if the resolved count exceeds [`MAX_HARDWARE_CONCURRENCY`].
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => number_of_workers(),
            ThreadCount::Count(count) => {
                check_ceiling(count);
                count
            }
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Returns the number of hardware execution contexts available to this
/// process.
///
/// The value is measured on first use and never changes afterwards. In debug
/// builds, each call re-measures it and asserts that the platform still
/// reports the same value, as the process cannot legally change core count
/// while running.
///
/// On Linux and Android, this is the number of online CPUs, regardless of the
/// CPU affinity of the calling thread. Elsewhere, it is
/// [`std::thread::available_parallelism()`].
///
/// ```
/// let workers = sweater::number_of_workers();
/// assert_eq!(workers, sweater::number_of_workers());
/// ```
///
/// # Panics
///
/// Panics if the measured value exceeds [`MAX_HARDWARE_CONCURRENCY`], or if
/// the available parallelism cannot be queried on this platform.
pub fn number_of_workers() -> NonZeroUsize {
    let hardware_concurrency = hardware_concurrency();

    if cfg!(debug_assertions) {
        assert_eq!(
            hardware_concurrency,
            measure(),
            "Hardware concurrency changed at runtime!?"
        );
    }
    check_ceiling(hardware_concurrency);
    hardware_concurrency
}

/// Measured value, cached for the lifetime of the process.
fn hardware_concurrency() -> NonZeroUsize {
    static HARDWARE_CONCURRENCY: OnceLock<NonZeroUsize> = OnceLock::new();

    *HARDWARE_CONCURRENCY.get_or_init(|| {
        let measured = measure();
        log_debug!("Measured hardware concurrency: {measured}");
        measured
    })
}

/// Number of online CPUs. Unlike [`std::thread::available_parallelism()`],
/// this doesn't depend on the affinity of the calling thread.
#[cfg(all(not(miri), any(target_os = "android", target_os = "linux")))]
fn measure() -> NonZeroUsize {
    let online = sysconf(SysconfVar::_NPROCESSORS_ONLN)
        .ok()
        .flatten()
        .and_then(|count| usize::try_from(count).ok())
        .and_then(NonZeroUsize::new);
    match online {
        Some(online) => online,
        None => {
            log_warn!("Failed to count the online CPUs, using the available parallelism");
            available_parallelism()
        }
    }
}

#[cfg(any(miri, not(any(target_os = "android", target_os = "linux"))))]
fn measure() -> NonZeroUsize {
    available_parallelism()
}

fn available_parallelism() -> NonZeroUsize {
    std::thread::available_parallelism().expect("Getting the available parallelism failed")
}

/// Asserts that the given number of workers doesn't exceed the configured
/// ceiling.
pub(crate) fn check_ceiling(count: NonZeroUsize) {
    check_ceiling_against(count, MAX_HARDWARE_CONCURRENCY);
}

fn check_ceiling_against(count: NonZeroUsize, max: Option<NonZeroUsize>) {
    if let Some(max) = max {
        assert!(
            count <= max,
            "{count} workers exceed the configured maximum hardware concurrency of {max}"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_thread_count_resolves() {
        assert_eq!(
            ThreadCount::try_from(3).unwrap().count(),
            NonZeroUsize::try_from(3).unwrap()
        );
        assert_eq!(ThreadCount::AvailableParallelism.count(), number_of_workers());
    }

    #[test]
    fn test_number_of_workers_is_stable() {
        let first = number_of_workers();
        let second = number_of_workers();
        assert_eq!(first, second);
        if let Some(max) = MAX_HARDWARE_CONCURRENCY {
            assert!(first <= max);
        }
    }

    #[cfg(all(not(miri), any(target_os = "android", target_os = "linux")))]
    #[test]
    fn test_number_of_workers_ignores_thread_affinity() {
        use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
        use nix::unistd::Pid;

        let pinned = std::thread::spawn(|| {
            // Narrow this thread to the first CPU it may run on.
            let allowed = sched_getaffinity(Pid::from_raw(0)).unwrap();
            let first = (0..CpuSet::count())
                .find(|&cpu| allowed.is_set(cpu).unwrap())
                .unwrap();
            let mut cpu_set = CpuSet::new();
            cpu_set.set(first).unwrap();
            sched_setaffinity(Pid::from_raw(0), &cpu_set).unwrap();
            (number_of_workers(), measure())
        })
        .join()
        .unwrap();

        assert_eq!(pinned, (number_of_workers(), number_of_workers()));
    }

    #[test]
    fn test_check_ceiling_within() {
        let four = NonZeroUsize::new(4).unwrap();
        check_ceiling_against(four, None);
        check_ceiling_against(four, Some(four));
        check_ceiling_against(NonZeroUsize::MIN, Some(four));
    }

    #[test]
    #[should_panic = "5 workers exceed the configured maximum hardware concurrency of 4"]
    fn test_check_ceiling_exceeded() {
        check_ceiling_against(NonZeroUsize::new(5).unwrap(), NonZeroUsize::new(4));
    }

    #[test]
    fn test_parse_ceiling() {
        assert_eq!(parse_ceiling(None), None);
        assert_eq!(parse_ceiling(Some("8")), NonZeroUsize::new(8));
        assert_eq!(parse_ceiling(Some("128")), NonZeroUsize::new(128));
    }

    #[test]
    #[should_panic = "SWEATER_MAX_HARDWARE_CONCURRENCY must be positive"]
    fn test_parse_ceiling_zero() {
        parse_ceiling(Some("0"));
    }

    #[test]
    #[should_panic = "SWEATER_MAX_HARDWARE_CONCURRENCY must be a decimal integer"]
    fn test_parse_ceiling_garbage() {
        parse_ceiling(Some("eight"));
    }
}
