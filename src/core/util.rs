// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, WaitTimeoutResult};
use std::time::Duration;

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status without waiting on the condition variable.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Attempts to set the status to the given value and notifies one waiting
    /// thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    #[cfg_attr(not(feature = "default-thread-pool"), allow(dead_code))]
    pub fn try_notify_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// Modifies the status in place and notifies one waiting thread.
    #[cfg_attr(not(feature = "default-thread-pool"), allow(dead_code))]
    pub fn update_notify_one<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut *self.mutex.lock().unwrap());
        self.condvar.notify_one();
        result
    }

    /// Modifies the status in place and notifies all waiting threads.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    pub fn try_update_notify_all<R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, PoisonError<MutexGuard<'_, T>>> {
        let result = f(&mut *self.mutex.lock()?);
        self.condvar.notify_all();
        Ok(result)
    }

    /// Modifies the status in place and notifies all waiting threads.
    pub fn update_notify_all<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.try_update_notify_all(f).unwrap()
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }

    /// Waits until the predicate is false on this status, or until the timeout
    /// elapses.
    pub fn wait_timeout_while(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'_, T>, WaitTimeoutResult) {
        self.condvar
            .wait_timeout_while(self.mutex.lock().unwrap(), timeout, predicate)
            .unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn status_wakes_waiter() {
        let status = Arc::new(Status::new(0));
        let waiter = std::thread::spawn({
            let status = status.clone();
            move || *status.wait_while(|x| *x < 3)
        });
        for _ in 0..3 {
            status.update_notify_all(|x| *x += 1);
        }
        assert_eq!(waiter.join().unwrap(), 3);
    }

    #[test]
    fn status_wait_timeout() {
        let status = Status::new(false);
        let (guard, result) = status.wait_timeout_while(Duration::from_millis(10), |done| !*done);
        assert!(!*guard);
        assert!(result.timed_out());
    }
}
