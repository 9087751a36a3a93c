// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives of the built-in thread pool.
//!
//! The main side of the pool uses a [`Lender`] to lend a fan-out task to the
//! workers and wait until they are done with it, and an [`Injector`] to push
//! fire-and-forget tasks to a queue. Each worker thread drives a [`Borrower`]
//! that serves both.

use super::task::{Runnable, Task};
use super::util::Status;
use crate::macros::{log_debug, log_error, log_trace};
use crate::threads::Priority;
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// A task lent to the workers for the duration of a round.
pub type FanOutTask<'a> = dyn Fn(usize) + Sync + 'a;

/// State of a worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// The thread is ready to pick up more work.
    Ready,
    /// The thread has been notified by the main thread to exit, and the queue
    /// of pending tasks is drained.
    Finished,
}

/// Status of the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainStatus {
    /// The main thread is waiting for the worker threads to finish a round.
    Waiting,
    /// The main thread is ready to prepare the next round.
    Ready,
}

/// The latest fan-out round published to the workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Round {
    /// Strictly increasing round number. Workers compare it with the last
    /// round they observed to detect a new one.
    generation: u64,
    /// Workers with an index below this take part in the round, the others
    /// skip it.
    num_tasks: usize,
}

/// Everything the worker threads wait on, under a single mutex.
struct WorkerSignal {
    /// Latest fan-out round.
    round: Round,
    /// Whether the worker threads must exit once the queues are drained.
    finished: bool,
    /// Pending fire-and-forget tasks of [`Priority::High`].
    high_priority: VecDeque<Task>,
    /// Pending fire-and-forget tasks of [`Priority::Default`].
    default_priority: VecDeque<Task>,
}

impl WorkerSignal {
    /// Pops the next pending fire-and-forget task, if any.
    fn pop_task(&mut self) -> Option<Task> {
        self.high_priority
            .pop_front()
            .or_else(|| self.default_priority.pop_front())
    }

    /// Returns whether there is any pending fire-and-forget task.
    fn has_tasks(&self) -> bool {
        !self.high_priority.is_empty() || !self.default_priority.is_empty()
    }
}

/// A lifetime-erased reference to a [`FanOutTask`]. This acts as a
/// [`&'a FanOutTask<'a>`](reference) whose lifetime can be adjusted via the
/// `unsafe` function [`get()`](Self::get).
struct FanOutView {
    task: Option<&'static FanOutTask<'static>>,
}

impl FanOutView {
    /// Creates a new empty reference.
    fn empty() -> Self {
        Self { task: None }
    }

    /// Sets the underlying task to the given reference. Subsequent calls to
    /// [`get()`](Self::get) must ensure that the obtained reference doesn't
    /// outlive the reference that was set here.
    fn set(&mut self, task: &FanOutTask<'_>) {
        // SAFETY: This only erases lifetimes, between two fat references to the
        // same trait object type. Uses of the erased reference are bounded by
        // the contract of `get()`.
        let task: &'static FanOutTask<'static> = unsafe { std::mem::transmute(task) };
        self.task = Some(task);
    }

    /// Clears the underlying reference. Subsequent calls to
    /// [`get()`](Self::get) will obtain [`None`].
    fn clear(&mut self) {
        self.task = None;
    }

    /// Returns the task that was previously set with [`set()`](Self::set), or
    /// [`None`] if the last task was cleared.
    ///
    /// # Safety
    ///
    /// The underlying task must be valid during the whole output lifetime.
    unsafe fn get<'a>(&self) -> Option<&'a FanOutTask<'a>> {
        self.task
    }
}

/// Context shared between the main side and the worker threads.
struct SharedContext {
    /// Number of worker threads active in the current round.
    num_active_threads: CachePadded<AtomicUsize>,
    /// Number of worker threads that panicked in the current round.
    num_panicking_threads: CachePadded<AtomicUsize>,
    /// Rounds, queued tasks and exit signal for the worker threads.
    worker_signal: Status<WorkerSignal>,
    /// Status of the main thread.
    main_status: Status<MainStatus>,
    /// Task lent to the worker threads in the current round.
    task: RwLock<FanOutView>,
}

impl SharedContext {
    /// Address identifying this group of threads.
    fn group_id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

thread_local! {
    /// Group of the built-in pool that the current thread works for, or 0.
    static CURRENT_GROUP: Cell<usize> = const { Cell::new(0) };
}

/// Creates a [`Lender`] and an [`Injector`] paired with `num_threads`
/// [`Borrower`]s.
pub fn make_lending_group(num_threads: usize) -> (Lender, Injector, Vec<Borrower>) {
    let shared_context = Arc::new(SharedContext {
        num_active_threads: CachePadded::new(AtomicUsize::new(0)),
        num_panicking_threads: CachePadded::new(AtomicUsize::new(0)),
        worker_signal: Status::new(WorkerSignal {
            round: Round {
                generation: 0,
                num_tasks: 0,
            },
            finished: false,
            high_priority: VecDeque::new(),
            default_priority: VecDeque::new(),
        }),
        main_status: Status::new(MainStatus::Waiting),
        task: RwLock::new(FanOutView::empty()),
    });

    let borrowers = (0..num_threads)
        .map(|id| Borrower {
            id,
            generation: 0,
            shared_context: shared_context.clone(),
        })
        .collect();

    let lender = Lender {
        generation: 0,
        shared_context: shared_context.clone(),
    };
    let injector = Injector { shared_context };

    (lender, injector, borrowers)
}

/// Context for the main side to lend fan-out tasks to the worker threads.
pub struct Lender {
    /// Number of the last round.
    generation: u64,
    /// Context shared between the main side and the worker threads.
    shared_context: Arc<SharedContext>,
}

impl Lender {
    /// Lends the given task to the first `num_tasks` worker threads, which call
    /// it with their index, and waits for all of them to be done with it.
    ///
    /// # Panics
    ///
    /// Panics once the round is over if any of the calls panicked.
    pub fn lend(&mut self, num_tasks: usize, task: &FanOutTask<'_>) {
        if num_tasks == 0 {
            return;
        }
        self.generation += 1;
        let generation = self.generation;

        self.shared_context
            .num_active_threads
            .store(num_tasks, Ordering::SeqCst);

        // Safety note: The reference set here is valid until the call to `clear()` at
        // the end of this function, which is after all the participating worker
        // threads are done reading it (as synchronized with `main_status`).
        self.shared_context.task.write().unwrap().set(task);
        log_debug!("[main thread, round {generation}] Ready to fan out {num_tasks} tasks.");

        self.shared_context.worker_signal.update_notify_all(|signal| {
            signal.round = Round {
                generation,
                num_tasks,
            };
        });

        log_debug!("[main thread, round {generation}] Waiting for all tasks to finish.");

        let mut guard = self
            .shared_context
            .main_status
            .wait_while(|status| *status == MainStatus::Waiting);
        assert_eq!(*guard, MainStatus::Ready);
        *guard = MainStatus::Waiting;
        drop(guard);

        // Safety note: the reference (previously set at the beginning of this function)
        // is cleared here after all the worker threads are done reading it (as
        // synchronized with `main_status`).
        self.shared_context.task.write().unwrap().clear();

        // The pool outlives this round, so the count is reset for the next one.
        let num_panicking_threads = self
            .shared_context
            .num_panicking_threads
            .swap(0, Ordering::SeqCst);
        if num_panicking_threads != 0 {
            log_error!(
                "[main thread, round {generation}] {num_panicking_threads} worker thread(s) panicked!"
            );
            panic!("{num_panicking_threads} worker thread(s) panicked!");
        }

        log_debug!("[main thread, round {generation}] All tasks have now finished.");
    }
}

/// Context for the main side to queue fire-and-forget tasks.
pub struct Injector {
    /// Context shared between the main side and the worker threads.
    shared_context: Arc<SharedContext>,
}

impl Injector {
    /// Queues the given task and wakes up a worker thread to run it.
    pub fn push(&self, priority: Priority, task: Task) {
        self.shared_context
            .worker_signal
            .update_notify_one(|signal| match priority {
                Priority::High => signal.high_priority.push_back(task),
                Priority::Default => signal.default_priority.push_back(task),
            });
    }

    /// Returns whether the current thread is one of the borrowing worker
    /// threads. Lending from such a thread would wait for itself forever.
    pub fn is_borrower_thread(&self) -> bool {
        CURRENT_GROUP.with(Cell::get) == self.shared_context.group_id()
    }

    /// Notifies the worker threads to exit once all queued tasks have run.
    pub fn finish_workers(&self) {
        log_debug!("[main thread] Notifying threads to finish...");
        if let Err(_e) = self
            .shared_context
            .worker_signal
            .try_update_notify_all(|signal| signal.finished = true)
        {
            log_error!("[main thread] Failed to notify the worker threads, the mutex was poisoned: {_e:?}");
        }
    }
}

/// Context for a worker thread to borrow fan-out tasks from the main side and
/// to pop queued tasks.
pub struct Borrower {
    /// Thread index.
    id: usize,
    /// Number of the last round observed by this thread.
    generation: u64,
    /// Context shared between the main side and the worker threads.
    shared_context: Arc<SharedContext>,
}

impl Borrower {
    /// Marks the current thread as a worker of this group. Must be called on
    /// the worker thread before the first [`step()`](Self::step).
    pub fn register_current_thread(&self) {
        CURRENT_GROUP.with(|group| group.set(self.shared_context.group_id()));
    }

    /// Waits for something to do, and does it.
    ///
    /// - If the main side lends a task via [`Lender::lend()`] and this thread
    ///   takes part in the round, calls the task with this thread's index.
    /// - Otherwise, if a task is queued via [`Injector::push()`], runs it.
    /// - Otherwise, if [`Injector::finish_workers()`] was called, returns
    ///   [`WorkerState::Finished`].
    pub fn step(&mut self) -> WorkerState {
        let last_generation = self.generation;
        let mut signal = self.shared_context.worker_signal.wait_while(|signal| {
            signal.round.generation == last_generation && !signal.has_tasks() && !signal.finished
        });

        if signal.round.generation != last_generation {
            let round = signal.round;
            drop(signal);
            self.generation = round.generation;
            if self.id < round.num_tasks {
                self.run_round(round.generation);
            } else {
                log_trace!(
                    "[thread {}, round {}] Not needed in this round.",
                    self.id,
                    round.generation
                );
            }
            return WorkerState::Ready;
        }

        if let Some(task) = signal.pop_task() {
            drop(signal);
            self.run_task(task);
            return WorkerState::Ready;
        }

        debug_assert!(signal.finished);
        log_debug!("[thread {}] Received finish signal", self.id);
        WorkerState::Finished
    }

    /// Runs this thread's share of a fan-out round.
    fn run_round(&self, _generation: u64) {
        log_trace!(
            "[thread {}, round {_generation}] Received start signal. Processing...",
            self.id
        );

        // Regardless of the task status (success or panic), we want to notify the
        // main thread that this thread has finished working with the task object.
        // This happens when the notifier is dropped.
        let notifier = Notifier {
            id: self.id,
            shared_context: &self.shared_context,
        };

        {
            let guard = self.shared_context.task.read().unwrap();
            // SAFETY:
            // - The output lifetime doesn't outlive the underlying task, as the main side
            //   waits until the [`Notifier`]s from all participating worker threads are
            //   dropped before clearing it and returning from [`Lender::lend()`].
            // - This thread has observed the round that set the task, and the task is only
            //   cleared after this round's notifiers are all dropped.
            let task = unsafe { guard.get() }.expect("no fan-out task was lent to this round");
            if catch_unwind(AssertUnwindSafe(|| task(self.id))).is_err() {
                log_error!(
                    "[thread {}] Detected panic in this thread, notifying the main thread",
                    self.id
                );
                self.shared_context
                    .num_panicking_threads
                    .fetch_add(1, Ordering::SeqCst);
            }
        }

        // Explicit drop for clarity.
        drop(notifier);
    }

    /// Runs a fire-and-forget task. A panic is logged and swallowed so that the
    /// thread keeps serving.
    fn run_task(&self, task: Task) {
        log_trace!("[thread {}] Running {task:?}", self.id);
        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            log_error!(
                "[thread {}] A fire-and-forget task panicked, ignoring it",
                self.id
            );
        }
    }
}

/// Object whose destructor notifies the main thread that a worker thread has
/// finished its share of a fan-out round.
struct Notifier<'a> {
    /// Thread index.
    #[cfg_attr(not(feature = "log"), allow(dead_code))]
    id: usize,
    /// Context shared between the main side and the worker threads.
    shared_context: &'a SharedContext,
}

impl Drop for Notifier<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log_error!(
                "[thread {}] Panicked outside of the fan-out task, notifying the main thread",
                self.id
            );
            self.shared_context
                .num_panicking_threads
                .fetch_add(1, Ordering::SeqCst);
        }

        let thread_count = self
            .shared_context
            .num_active_threads
            .fetch_sub(1, Ordering::SeqCst);
        assert!(thread_count > 0);
        log_trace!(
            "[thread {}] Decremented the number of active threads: {}.",
            self.id,
            thread_count - 1
        );

        if thread_count == 1 {
            // We're the last thread.
            log_trace!(
                "[thread {}] We're the last thread. Waking up the main thread.",
                self.id
            );

            if let Err(e) = self
                .shared_context
                .main_status
                .try_notify_one(MainStatus::Ready)
            {
                log_error!(
                    "[thread {}] Failed to notify the main thread, the mutex was poisoned: {e:?}",
                    self.id
                );
                panic!("Failed to notify the main thread, the mutex was poisoned: {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    /// Spawns one thread per borrower, stepping until finished.
    fn spawn_workers(borrowers: Vec<Borrower>) -> Vec<std::thread::JoinHandle<()>> {
        borrowers
            .into_iter()
            .map(|mut borrower| {
                std::thread::spawn(move || {
                    borrower.register_current_thread();
                    while borrower.step() == WorkerState::Ready {}
                })
            })
            .collect()
    }

    #[test]
    fn test_lend_reaches_participants_only() {
        let (mut lender, injector, borrowers) = make_lending_group(4);
        let handles = spawn_workers(borrowers);

        for num_tasks in [4, 1, 3, 2, 4] {
            let seen = Mutex::new(Vec::new());
            lender.lend(num_tasks, &|id| seen.lock().unwrap().push(id));
            let mut seen = seen.into_inner().unwrap();
            seen.sort();
            assert_eq!(seen, (0..num_tasks).collect::<Vec<_>>());
        }

        injector.finish_workers();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_lend_borrows_from_stack() {
        let (mut lender, injector, borrowers) = make_lending_group(2);
        let handles = spawn_workers(borrowers);

        let mut output = [0usize; 2];
        {
            let cells = output.each_mut().map(Mutex::new);
            lender.lend(2, &|id| **cells[id].lock().unwrap() = id + 10);
        }
        assert_eq!(output, [10, 11]);

        injector.finish_workers();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_queued_tasks_drain_before_exit() {
        let (_lender, injector, borrowers) = make_lending_group(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let counter = counter.clone();
            let priority = if i % 2 == 0 {
                Priority::High
            } else {
                Priority::Default
            };
            injector.push(
                priority,
                Task::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        // Workers are spawned late on purpose: the queue must be drained even
        // though the finish signal is already set.
        injector.finish_workers();
        for handle in spawn_workers(borrowers) {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_high_priority_runs_first() {
        let (_lender, injector, borrowers) = make_lending_group(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, priority) in [
            ("default", Priority::Default),
            ("high", Priority::High),
            ("default", Priority::Default),
        ] {
            let order = order.clone();
            injector.push(
                priority,
                Task::new(move || order.lock().unwrap().push(name)),
            );
        }
        injector.finish_workers();
        for handle in spawn_workers(borrowers) {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), ["high", "default", "default"]);
    }

    #[test]
    fn test_lend_reports_panics_and_recovers() {
        let (mut lender, injector, borrowers) = make_lending_group(3);
        let handles = spawn_workers(borrowers);

        let result = catch_unwind(AssertUnwindSafe(|| {
            lender.lend(3, &|id| {
                if id == 1 {
                    panic!("arithmetic panic");
                }
            })
        }));
        let payload = result.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<String>().map(String::as_str),
            Some("1 worker thread(s) panicked!")
        );

        // The workers survived and the next round is clean.
        let counter = AtomicUsize::new(0);
        lender.lend(3, &|_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        injector.finish_workers();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_is_borrower_thread() {
        let (_lender, injector, borrowers) = make_lending_group(1);
        assert!(!injector.is_borrower_thread());

        let borrower = borrowers.into_iter().next().unwrap();
        let group = std::thread::spawn(move || {
            borrower.register_current_thread();
            CURRENT_GROUP.with(Cell::get)
        })
        .join()
        .unwrap();
        assert_eq!(group, injector.shared_context.group_id());
    }
}
