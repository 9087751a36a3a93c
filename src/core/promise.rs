// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Single-shot result channel between an asynchronous task and the caller that
//! submitted it.

use super::util::Status;
use crate::macros::log_trace;
use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Failure observed through a [`ResultHandle`].
///
/// This error is `Send + Sync`, so it converts into
/// `Box<dyn std::error::Error + Send + Sync>` with `?`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The work panicked. This carries the original panic payload.
    #[error("dispatched work panicked: {}", .0.message().unwrap_or("Box<dyn Any>"))]
    Panicked(PanicPayload),
    /// The work was dropped by the thread pool without ever running.
    #[error("dispatched work was dropped before running")]
    Abandoned,
}

impl DispatchError {
    /// Returns the panic message, if the work panicked with a string payload
    /// (as is the case for [`panic!`] with a message).
    pub fn message(&self) -> Option<&str> {
        match self {
            DispatchError::Panicked(payload) => payload.message(),
            DispatchError::Abandoned => None,
        }
    }

    /// Re-raises the original panic on the current thread.
    ///
    /// An [`Abandoned`](Self::Abandoned) error is raised as a new panic.
    pub fn resume(self) -> ! {
        match self {
            DispatchError::Panicked(payload) => resume_unwind(payload.into_inner()),
            DispatchError::Abandoned => panic!("dispatched work was dropped before running"),
        }
    }
}

/// Payload of a panic raised by dispatched work.
///
/// A panic payload is only `Send`. It is kept behind a mutex so that
/// [`DispatchError`] can be shared across threads.
pub struct PanicPayload {
    /// Copy of the message, for string payloads.
    message: Option<String>,
    payload: Mutex<Box<dyn Any + Send + 'static>>,
}

impl PanicPayload {
    fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = panic_message(payload.as_ref()).map(str::to_owned);
        Self {
            message,
            payload: Mutex::new(payload),
        }
    }

    /// Returns the panic message, if the payload is a `&str` or a [`String`].
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns whether the payload is of type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is::<T>()
    }

    /// Returns the original payload, as passed to
    /// [`std::panic::resume_unwind()`].
    pub fn into_inner(self) -> Box<dyn Any + Send + 'static> {
        self.payload
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PanicPayload")
            .field(&self.message().unwrap_or("Box<dyn Any>"))
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// State of the shared result slot.
enum Slot<R> {
    /// The producer hasn't written anything yet.
    Pending,
    /// The producer wrote its outcome, not yet taken by the consumer.
    Ready(Result<R, DispatchError>),
    /// The consumer took the outcome.
    Taken,
}

impl<R> Slot<R> {
    fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending)
    }
}

/// Creates a connected producer/consumer pair.
pub fn channel<R>() -> (Promise<R>, ResultHandle<R>) {
    let slot = Arc::new(Status::new(Slot::Pending));
    (
        Promise {
            slot: Some(slot.clone()),
        },
        ResultHandle { slot },
    )
}

/// Producer side of a result channel.
///
/// Consumed by [`fulfill()`](Self::fulfill). If dropped without being
/// fulfilled, the consumer observes [`DispatchError::Abandoned`].
pub struct Promise<R> {
    slot: Option<Arc<Status<Slot<R>>>>,
}

impl<R> Promise<R> {
    /// Runs the given work, capturing its return value or its panic, and
    /// publishes the outcome to the consumer.
    pub fn fulfill(mut self, work: impl FnOnce() -> R) {
        let outcome = catch_unwind(AssertUnwindSafe(work))
            .map_err(|payload| DispatchError::Panicked(PanicPayload::new(payload)));
        log_trace!(
            "Publishing dispatched result (panicked = {})",
            outcome.is_err()
        );
        if let Some(slot) = self.slot.take() {
            publish(&slot, outcome);
        }
    }
}

impl<R> Drop for Promise<R> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            log_trace!("Dispatched work dropped before running");
            publish(&slot, Err(DispatchError::Abandoned));
        }
    }
}

fn publish<R>(slot: &Status<Slot<R>>, outcome: Result<R, DispatchError>) {
    // The producer runs on a worker thread: if the consumer side somehow
    // poisoned the mutex there is nobody left to report to.
    let _ = slot.try_update_notify_all(|slot| {
        debug_assert!(slot.is_pending(), "result channel written twice");
        *slot = Slot::Ready(outcome);
    });
}

/// Consumer side of a result channel, returned by
/// [`Dispatcher::dispatch()`](crate::Dispatcher::dispatch).
///
/// The handle may be dropped at any time without waiting: the work still runs
/// and its result is discarded.
pub struct ResultHandle<R> {
    slot: Arc<Status<Slot<R>>>,
}

impl<R> ResultHandle<R> {
    /// Returns whether the outcome is available, i.e. whether
    /// [`get()`](Self::get) would return without blocking.
    pub fn is_ready(&self) -> bool {
        !self.slot.lock().is_pending()
    }

    /// Blocks until the outcome is available.
    pub fn wait(&self) {
        drop(self.slot.wait_while(|slot| slot.is_pending()));
    }

    /// Blocks until the outcome is available or the timeout elapses. Returns
    /// whether the outcome is available.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (guard, _) = self
            .slot
            .wait_timeout_while(timeout, |slot| slot.is_pending());
        !guard.is_pending()
    }

    /// Blocks until the work completes, and returns its value or the panic it
    /// raised.
    pub fn get(self) -> Result<R, DispatchError> {
        let mut guard = self.slot.wait_while(|slot| slot.is_pending());
        match std::mem::replace(&mut *guard, Slot::Taken) {
            Slot::Ready(outcome) => outcome,
            Slot::Pending | Slot::Taken => unreachable!("result channel read twice"),
        }
    }

    /// Blocks until the work completes and returns its value, re-raising its
    /// panic on the current thread if it panicked.
    pub fn join(self) -> R {
        self.get().unwrap_or_else(|e| e.resume())
    }
}

impl<R> std::fmt::Debug for ResultHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}
