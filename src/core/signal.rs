//! Batch completion tracking.
//!
//! A `CompletionSignal` counts down from the number of tasks in flight to
//! zero. Every task holds a shared reference to its batch's signal and
//! reports in exactly once, whether it ran to completion, panicked, or was
//! cancelled before executing. The thread that performs the final decrement
//! wakes any waiters and runs the follow-up action (completion callback and
//! batch chaining) installed for the current cycle.

use crate::sync::{Ordering, AtomicU32, Mutex, Condvar};

use crossbeam_utils::Backoff;

type OnZero = Box<dyn FnOnce() + Send + 'static>;

pub struct CompletionSignal {
    // The number of tasks that have not yet reported in.
    remaining: AtomicU32,
    // As a last resort, a condition variable and its mutex for waiters that
    // couldn't observe completion within a short spin.
    mutex: Mutex<()>,
    cond: Condvar,
    // Taken exactly once, by whichever thread performs the final decrement.
    on_zero: Mutex<Option<OnZero>>,
}

impl CompletionSignal {
    pub const MAX_TASKS: u32 = u32::MAX / 2;

    /// Creates a signal in the completed state.
    pub fn new() -> Self {
        CompletionSignal {
            remaining: AtomicU32::new(0),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
            on_zero: Mutex::new(None),
        }
    }

    /// Arm the signal for a new cycle of `count` tasks.
    ///
    /// Only valid while the signal is completed; the task count of a cycle
    /// never changes once armed.
    pub fn reset(&self, count: u32) {
        assert!(self.is_completed(), "resetting a signal that is still in flight");
        debug_assert!(count <= Self::MAX_TASKS);
        self.remaining.store(count, Ordering::Release);
    }

    /// Install the action to run when the current cycle completes.
    ///
    /// Must be installed after `reset` and before the first task of the
    /// cycle is published, otherwise the final decrement can race past it.
    pub fn set_on_zero<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.on_zero.lock().unwrap();
        debug_assert!(slot.is_none(), "completion action already installed");
        *slot = Some(Box::new(action));
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Report one task as finished (executed or cancelled).
    ///
    /// Returns true iff this call completed the cycle. Never call while
    /// holding a scheduler's queue lock: the completion action may enqueue
    /// a chained batch into any scheduler.
    pub fn finish_one(&self) -> bool {
        profiling::scope!("finish_one");

        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "completion signal went negative");

        if prev != 1 {
            return false;
        }

        let action = self.on_zero.lock().unwrap().take();

        {
            std::mem::drop(self.mutex.lock().unwrap());

            self.cond.notify_all();
        }

        if let Some(action) = action {
            action();
        }

        true
    }

    /// Block the calling thread until the current cycle completes.
    pub fn wait(&self) {
        profiling::scope!("wait");

        // Most batches complete quickly, so spin for a moment before
        // committing to the condition variable.
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.is_completed() {
                return;
            }
            backoff.snooze();
        }

        let mut guard = self.mutex.lock().unwrap();
        while self.remaining.load(Ordering::Acquire) > 0 {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        CompletionSignal::new()
    }
}

#[test]
fn signal_counts_down_once() {
    use crate::sync::Arc;

    let signal = Arc::new(CompletionSignal::new());
    assert!(signal.is_completed());

    signal.reset(3);
    assert!(!signal.is_completed());
    assert_eq!(signal.remaining(), 3);

    assert!(!signal.finish_one());
    assert!(!signal.finish_one());
    assert!(signal.finish_one());
    assert!(signal.is_completed());

    // A completed signal can be re-armed.
    signal.reset(1);
    assert!(!signal.is_completed());
    assert!(signal.finish_one());
}

#[test]
fn signal_on_zero_runs_on_final_decrement() {
    use crate::sync::{Arc, AtomicU32};

    let signal = Arc::new(CompletionSignal::new());
    let fired = Arc::new(AtomicU32::new(0));

    signal.reset(2);
    let f = Arc::clone(&fired);
    signal.set_on_zero(move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    signal.finish_one();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    signal.finish_one();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn signal_wait_across_threads() {
    use crate::sync::Arc;

    for _ in 0..100 {
        let signal = Arc::new(CompletionSignal::new());
        signal.reset(4);

        let mut joins = Vec::new();
        for _ in 0..4 {
            let signal = Arc::clone(&signal);
            joins.push(std::thread::spawn(move || {
                signal.finish_one();
            }));
        }

        signal.wait();
        assert!(signal.is_completed());

        for join in joins {
            join.join().unwrap();
        }
    }
}
