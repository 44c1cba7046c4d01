//! The scheduling facade.
//!
//! `TaskSystem` owns one worker pool per `PoolKind` and is the routing entry
//! point for batches and single tasks. It is an explicitly constructed,
//! cheaply cloneable handle (shared ownership, no global singleton), so
//! initialization and teardown order are in the embedder's hands.

use crate::batch::TaskBatch;
use crate::core::pool::{PoolKind, WorkerPool};
use crate::core::task::{Task, TaskRef};
use crate::core::{ThreadHooks, WorkerHook};
use crate::sync::{Ordering, Arc, AtomicBool};

type NameHandler = Box<dyn Fn(PoolKind, u32) -> String + Send + Sync>;

pub(crate) struct SystemShared {
    pools: Vec<WorkerPool>,
    running: AtomicBool,
    hooks: Arc<ThreadHooks>,
    name_handler: NameHandler,
    stack_size: Option<usize>,
}

/// A reference to the task system.
#[derive(Clone)]
pub struct TaskSystem {
    shared: Arc<SystemShared>,
}

impl TaskSystem {
    pub fn builder() -> TaskSystemBuilder {
        TaskSystemBuilder {
            num_threads: PoolKind::all().map(PoolKind::default_threads),
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|pool, index| {
                format!("{}-worker#{}", pool.label(), index)
            }),
            stack_size: None,
        }
    }

    /// Start every pool's workers. Starting an already running system is a
    /// programming error.
    pub fn start(&self) {
        let was_running = self.shared.running.swap(true, Ordering::SeqCst);
        assert!(!was_running, "task system started twice");

        tracing::debug!("starting task system");

        for pool in &self.shared.pools {
            pool.start(
                &self.shared.hooks,
                self.shared.name_handler.as_ref(),
                self.shared.stack_size,
            );
        }
    }

    /// Stop and join every worker. Each worker fully drains its queue
    /// before exiting, so no task leaks across a stop/start cycle.
    /// Stopping a system that isn't running is a programming error.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        assert!(was_running, "task system is not running");

        for pool in &self.shared.pools {
            pool.request_stop();
        }
        for pool in &self.shared.pools {
            pool.join_all();
        }

        tracing::debug!("task system stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn num_threads(&self, pool: PoolKind) -> u32 {
        self.pool(pool).num_threads()
    }

    /// Fire-and-forget a single task onto a pool.
    ///
    /// Work may be scheduled while the system is stopped; it sits in the
    /// target thread's queue until `start`.
    pub fn schedule<F>(&self, pool: PoolKind, body: F) -> TaskRef
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = self.pool(pool).next_task_thread();
        let scheduler = Arc::clone(worker.scheduler());
        let id = scheduler.enqueue_task(Task::new(body), None);
        TaskRef { scheduler, id }
    }

    /// Best-effort cancellation of a single scheduled task.
    pub fn unschedule(&self, task: &TaskRef) -> bool {
        task.cancel()
    }

    /// Distribute a batch's pending tasks across its pool.
    ///
    /// The completion signal is armed to the task count before any task is
    /// published. An empty batch completes synchronously within this call:
    /// its callback and chained batch fire with no thread hand-off.
    /// Re-enqueueing a batch that is still in flight is a programming error.
    pub fn enqueue_batch(&self, batch: &Arc<TaskBatch>) {
        profiling::scope!("enqueue_batch");

        assert!(
            batch.is_completed(),
            "batch re-enqueued while still in flight"
        );

        let mut pending = batch.take_pending();
        let count = pending.len();

        if count == 0 {
            batch.fire_completion(self);
            return;
        }

        let signal = Arc::clone(batch.signal());
        signal.reset(count as u32);
        {
            let system = self.clone();
            let completed = Arc::clone(batch);
            signal.set_on_zero(move || completed.fire_completion(&system));
        }

        let pool = self.pool(batch.pool());
        let mut refs = Vec::with_capacity(count);
        for task in pending.drain(..) {
            let worker = pool.next_task_thread();
            let scheduler = Arc::clone(worker.scheduler());
            let id = scheduler.enqueue_task(task, Some(Arc::clone(&signal)));
            refs.push(TaskRef { scheduler, id });
        }
        batch.set_refs(refs);
    }

    /// Best-effort cancellation of every task of the batch's current cycle.
    ///
    /// The returned vector reports, per task, whether it was removed before
    /// execution began. Tasks already executing or executed report `false`,
    /// which is a normal outcome, not an error. Cancelled tasks still count
    /// toward completion, so cancelling everything completes the batch.
    pub fn dequeue_batch(&self, batch: &Arc<TaskBatch>) -> Vec<bool> {
        batch
            .task_refs()
            .iter()
            .map(|task_ref| task_ref.cancel())
            .collect()
    }

    fn pool(&self, kind: PoolKind) -> &WorkerPool {
        &self.shared.pools[kind.index()]
    }
}

pub struct TaskSystemBuilder {
    num_threads: [u32; PoolKind::COUNT],
    start_handler: Option<Box<dyn WorkerHook>>,
    exit_handler: Option<Box<dyn WorkerHook>>,
    name_handler: NameHandler,
    stack_size: Option<usize>,
}

impl TaskSystemBuilder {
    /// Fix a pool's thread count (clamped to at least one).
    pub fn with_pool_threads(mut self, pool: PoolKind, num_threads: u32) -> Self {
        self.num_threads[pool.index()] = num_threads.max(1);

        self
    }

    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(PoolKind, u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(PoolKind, u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(PoolKind, u32) -> String + Send + Sync + 'static
    {
        self.name_handler = Box::new(handler);

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    /// Build the system in the stopped state; `start` spawns the threads.
    pub fn build(self) -> TaskSystem {
        let pools = PoolKind::all()
            .into_iter()
            .map(|kind| WorkerPool::new(kind, self.num_threads[kind.index()]))
            .collect();

        TaskSystem {
            shared: Arc::new(SystemShared {
                pools,
                running: AtomicBool::new(false),
                hooks: Arc::new(ThreadHooks {
                    start: self.start_handler,
                    exit: self.exit_handler,
                }),
                name_handler: self.name_handler,
                stack_size: self.stack_size,
            }),
        }
    }
}

#[cfg(test)]
fn small_system(generic_threads: u32) -> TaskSystem {
    TaskSystem::builder()
        .with_pool_threads(PoolKind::Generic, generic_threads)
        .with_pool_threads(PoolKind::Render, 1)
        .with_pool_threads(PoolKind::Background, 1)
        .build()
}

#[test]
fn start_stop_runs_hooks_symmetrically() {
    static STARTED: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
    static EXITED: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

    for num_threads in 1u32..5 {
        STARTED.store(0, Ordering::SeqCst);
        EXITED.store(0, Ordering::SeqCst);

        let system = TaskSystem::builder()
            .with_pool_threads(PoolKind::Generic, num_threads)
            .with_pool_threads(PoolKind::Render, 1)
            .with_pool_threads(PoolKind::Background, 1)
            .with_start_handler(|_pool, _index| { STARTED.fetch_add(1, Ordering::SeqCst); })
            .with_exit_handler(|_pool, _index| { EXITED.fetch_add(1, Ordering::SeqCst); })
            .build();

        assert!(!system.is_running());
        system.start();
        assert!(system.is_running());
        system.stop();
        assert!(!system.is_running());

        assert_eq!(STARTED.load(Ordering::SeqCst), num_threads + 2);
        assert_eq!(EXITED.load(Ordering::SeqCst), num_threads + 2);
    }
}

#[test]
#[should_panic]
fn starting_twice_asserts() {
    let system = small_system(1);
    system.start();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        system.start();
    }));
    system.stop();
    result.unwrap();
}

#[test]
#[should_panic]
fn stopping_a_stopped_system_asserts() {
    let system = small_system(1);
    system.stop();
}

#[test]
fn batch_completes_across_the_pool() {
    use crate::sync::AtomicU32;
    use std::time::Instant;

    let system = small_system(4);
    system.start();

    let counter = Arc::new(AtomicU32::new(0));
    let batch = TaskBatch::new();
    for _ in 0..8 {
        let counter = Arc::clone(&counter);
        batch.add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    let enqueued_at = Instant::now();
    system.enqueue_batch(&batch);
    batch.await_completion();

    assert!(batch.is_completed());
    assert_eq!(counter.load(Ordering::SeqCst), 8);
    // Generous bound; the point is that awaiting never hangs.
    assert!(enqueued_at.elapsed().as_secs() < 30);

    system.stop();
}

#[test]
fn empty_batch_completes_synchronously() {
    use crate::sync::AtomicU32;

    // The system is never started: an empty batch must complete (and fire
    // its callback exactly once) with no thread hand-off at all.
    let system = small_system(2);

    let fired = Arc::new(AtomicU32::new(0));
    let batch = TaskBatch::new();
    let f = Arc::clone(&fired);
    batch.on_complete(move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    system.enqueue_batch(&batch);
    assert!(batch.is_completed());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn dequeue_batch_before_any_execution_cancels_everything() {
    use crate::sync::AtomicU32;

    // Workers are not started, so nothing can race the cancellation.
    let system = small_system(2);

    let executed = Arc::new(AtomicU32::new(0));
    let batch = TaskBatch::new();
    for _ in 0..6 {
        let executed = Arc::clone(&executed);
        batch.add(move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }

    system.enqueue_batch(&batch);
    assert!(!batch.is_completed());

    let cancelled = system.dequeue_batch(&batch);
    assert_eq!(cancelled.len(), 6);
    assert!(cancelled.iter().all(|cancelled| *cancelled));

    // Cancellations count as completion events; no body ever ran.
    assert!(batch.is_completed());
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    // A second attempt reports all-false, which is benign.
    let cancelled = system.dequeue_batch(&batch);
    assert!(cancelled.iter().all(|cancelled| !*cancelled));
}

#[test]
fn chained_batch_runs_strictly_after_its_predecessor() {
    use crate::core::signal::CompletionSignal;
    use crate::sync::Mutex;

    let system = small_system(4);
    system.start();

    let log = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(CompletionSignal::new());
    done.reset(1);

    let first = TaskBatch::new();
    for _ in 0..4 {
        let log = Arc::clone(&log);
        first.add(move || {
            log.lock().unwrap().push("first");
        });
    }

    let second = TaskBatch::new();
    for _ in 0..4 {
        let log = Arc::clone(&log);
        second.add(move || {
            log.lock().unwrap().push("second");
        });
    }
    let d = Arc::clone(&done);
    second.on_complete(move || {
        d.finish_one();
    });

    first.set_next(Arc::clone(&second));
    system.enqueue_batch(&first);

    done.wait();
    system.stop();

    // The chained batch is only assigned once the predecessor's counter
    // reaches zero, so every "first" precedes every "second".
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 8);
    assert!(log[..4].iter().all(|entry| *entry == "first"));
    assert!(log[4..].iter().all(|entry| *entry == "second"));
}

#[test]
fn batch_submitted_from_inside_a_worker_completes() {
    use crate::core::signal::CompletionSignal;
    use crate::sync::AtomicU32;

    let system = small_system(2);
    system.start();

    let counter = Arc::new(AtomicU32::new(0));
    let done = Arc::new(CompletionSignal::new());
    done.reset(1);

    // Recursive scheduling: a worker of the generic pool builds and
    // enqueues a batch onto its own pool.
    let inner_system = system.clone();
    let inner_counter = Arc::clone(&counter);
    let inner_done = Arc::clone(&done);
    system.schedule(PoolKind::Generic, move || {
        let inner = TaskBatch::new();
        let counter = Arc::clone(&inner_counter);
        inner.add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let done = Arc::clone(&inner_done);
        inner.on_complete(move || {
            done.finish_one();
        });
        inner_system.enqueue_batch(&inner);
    });

    done.wait();
    system.stop();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn awaiting_on_an_owned_scheduler_is_a_fatal_assert() {
    use crate::core::signal::CompletionSignal;
    use crate::sync::{AtomicBool, AtomicU32};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    // One generic worker: selection from inside the worker degrades to its
    // own queue, so awaiting there is guaranteed to be the deadlock case.
    let system = small_system(1);
    system.start();

    let misuse_caught = Arc::new(AtomicBool::new(false));
    let executed = Arc::new(AtomicU32::new(0));
    let done = Arc::new(CompletionSignal::new());
    done.reset(1);

    let inner_system = system.clone();
    let caught = Arc::clone(&misuse_caught);
    let inner_executed = Arc::clone(&executed);
    let inner_done = Arc::clone(&done);
    system.schedule(PoolKind::Generic, move || {
        let inner = TaskBatch::new();
        let executed = Arc::clone(&inner_executed);
        inner.add(move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
        let done = Arc::clone(&inner_done);
        inner.on_complete(move || {
            done.finish_one();
        });
        inner_system.enqueue_batch(&inner);

        // The batch sits in this worker's own queue; blocking on it here
        // can never make progress and must be refused loudly.
        let result = catch_unwind(AssertUnwindSafe(|| inner.await_completion()));
        caught.store(result.is_err(), Ordering::SeqCst);
    });

    done.wait();
    system.stop();

    assert!(misuse_caught.load(Ordering::SeqCst));
    // The refused await did not eat the task: it still ran.
    assert_eq!(executed.load(Ordering::SeqCst), 1);
}

#[test]
fn work_enqueued_while_stopped_runs_after_start() {
    use crate::sync::AtomicU32;

    let system = small_system(2);

    let counter = Arc::new(AtomicU32::new(0));
    let batch = TaskBatch::new();
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        batch.add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    system.enqueue_batch(&batch);
    assert!(!batch.is_completed());
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    system.start();
    batch.await_completion();
    system.stop();

    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn stop_drains_everything_and_the_system_restarts() {
    use crate::sync::AtomicU32;

    let system = small_system(2);
    system.start();

    let counter = Arc::new(AtomicU32::new(0));
    let batch = TaskBatch::new();
    for _ in 0..64 {
        let counter = Arc::clone(&counter);
        batch.add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    system.enqueue_batch(&batch);

    // Stop joins, and workers drain their queues fully before exiting.
    system.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 64);
    assert!(batch.is_completed());

    // A completed batch can accumulate new tasks and go around again.
    for _ in 0..8 {
        let counter = Arc::clone(&counter);
        batch.add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    system.start();
    system.enqueue_batch(&batch);
    batch.await_completion();
    system.stop();

    assert_eq!(counter.load(Ordering::SeqCst), 72);
}

#[test]
fn panicking_task_does_not_hang_its_batch() {
    use crate::sync::AtomicU32;

    let system = small_system(2);
    system.start();

    let counter = Arc::new(AtomicU32::new(0));
    let batch = TaskBatch::new();
    batch.add(|| panic!("task body failure"));
    for _ in 0..3 {
        let counter = Arc::clone(&counter);
        batch.add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    system.enqueue_batch(&batch);
    batch.await_completion();
    system.stop();

    assert!(batch.is_completed());
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn schedule_and_unschedule_single_tasks() {
    use crate::sync::AtomicBool;

    let system = small_system(2);

    // While stopped, a scheduled task is pending and can be unscheduled.
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let task_ref = system.schedule(PoolKind::Background, move || {
        flag.store(true, Ordering::SeqCst);
    });
    assert!(task_ref.is_pending());
    assert!(system.unschedule(&task_ref));
    assert!(!task_ref.is_pending());
    assert!(!system.unschedule(&task_ref));

    // Once executed, unscheduling reports false forever.
    system.start();
    let flag = Arc::clone(&ran);
    let task_ref = system.schedule(PoolKind::Generic, move || {
        flag.store(true, Ordering::SeqCst);
    });
    while !ran.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    assert!(!system.unschedule(&task_ref));
    system.stop();
}
