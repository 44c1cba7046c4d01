//! The worker thread wrapper.
//!
//! A worker wraps exactly one scheduler and runs a drain/execute/park loop
//! against it. Workers move through `NotStarted -> Running -> StopRequested
//! -> Stopped` and can be restarted after a full stop; the scheduler (and
//! thus pending work enqueued while stopped) survives across restarts.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crossbeam_utils::sync::Parker;

use crate::sync::{Ordering, Arc, Mutex, AtomicU32, AtomicBool, thread};

use super::pool::{PoolId, PoolKind, register_current_worker, clear_current_worker};
use super::scheduler::Scheduler;
use super::task::QueuedTask;
use super::ThreadHooks;

const STATE_NOT_STARTED: u32 = 0;
const STATE_RUNNING: u32 = 1;
const STATE_STOP_REQUESTED: u32 = 2;
const STATE_STOPPED: u32 = 3;

pub(crate) struct WorkerShared {
    scheduler: Arc<Scheduler>,
    state: AtomicU32,
    // Best-effort "parked with nothing to do" flag, read by thread
    // selection. Not authoritative.
    is_free: AtomicBool,
}

pub(crate) struct WorkerThread {
    index: u32,
    shared: Arc<WorkerShared>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerThread {
    pub fn new(index: u32) -> Self {
        WorkerThread {
            index,
            shared: Arc::new(WorkerShared {
                scheduler: Arc::new(Scheduler::new()),
                state: AtomicU32::new(STATE_NOT_STARTED),
                is_free: AtomicBool::new(false),
            }),
            join_handle: Mutex::new(None),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.shared.scheduler
    }

    pub fn is_free(&self) -> bool {
        self.shared.is_free.load(Ordering::Relaxed)
    }

    /// Spawn the OS thread. Starting a worker that is already running is a
    /// programming error.
    pub fn start(
        &self,
        pool: PoolKind,
        pool_id: PoolId,
        hooks: Arc<ThreadHooks>,
        name: String,
        stack_size: Option<usize>,
    ) {
        let state = self.shared.state.load(Ordering::Acquire);
        assert!(
            state == STATE_NOT_STARTED || state == STATE_STOPPED,
            "worker {} started twice",
            self.index,
        );

        let parker = Parker::new();
        self.shared.scheduler.set_unparker(Some(parker.unparker().clone()));
        self.shared.state.store(STATE_RUNNING, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let index = self.index;

        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(move || {
                profiling::register_thread!("Worker");

                run(shared, parker, pool, pool_id, index, hooks);
            })
            .unwrap();

        *self.join_handle.lock().unwrap() = Some(handle);
    }

    /// Ask the worker to stop. Does not block; the worker fully drains its
    /// queue before exiting.
    pub fn request_stop(&self) {
        let _ = self.shared.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOP_REQUESTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.shared.scheduler.wake();
    }

    /// Block until the OS thread exits.
    pub fn join(&self) {
        let handle = self.join_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().expect("worker thread panicked");
        }
        self.shared.scheduler.set_unparker(None);
    }
}

fn run(
    shared: Arc<WorkerShared>,
    parker: Parker,
    pool: PoolKind,
    pool_id: PoolId,
    index: u32,
    hooks: Arc<ThreadHooks>,
) {
    register_current_worker(pool_id, index);
    shared.scheduler.bind_owner();

    if let Some(handler) = &hooks.start {
        handler.run(pool, index);
    }

    tracing::trace!(pool = pool.label(), worker = index, "worker running");

    let mut batch = Vec::new();
    loop {
        shared.scheduler.accept_all(&mut batch);

        if batch.is_empty() {
            if shared.state.load(Ordering::Acquire) == STATE_STOP_REQUESTED {
                break;
            }

            shared.is_free.store(true, Ordering::Release);
            parker.park();
            shared.is_free.store(false, Ordering::Release);
            continue;
        }

        for entry in batch.drain(..) {
            execute_task(entry);
        }
    }

    if let Some(handler) = &hooks.exit {
        handler.run(pool, index);
    }

    tracing::trace!(pool = pool.label(), worker = index, "worker stopped");

    shared.scheduler.release_owner();
    clear_current_worker();
    shared.is_free.store(false, Ordering::Release);
    shared.state.store(STATE_STOPPED, Ordering::Release);
}

/// Execute one drained queue entry.
///
/// A panicking task is the task's own instability; the worker reports it
/// and moves on. The completion signal is decremented either way so a batch
/// can never hang on a failing task.
fn execute_task(entry: QueuedTask) {
    profiling::scope!("execute_task");

    let QueuedTask { id, task, signal, .. } = entry;

    let result = catch_unwind(AssertUnwindSafe(move || task.execute()));
    if result.is_err() {
        tracing::error!(task_id = id.0, "task panicked; worker continues");
    }

    if let Some(signal) = signal {
        signal.finish_one();
    }
}

#[test]
fn worker_executes_and_drains_on_stop() {
    use crate::core::signal::CompletionSignal;
    use crate::core::task::Task;
    use crate::sync::{Arc, AtomicU32};

    let hooks = Arc::new(ThreadHooks { start: None, exit: None });
    let pool_id = PoolId(u32::MAX);

    for _ in 0..20 {
        let worker = WorkerThread::new(0);
        let executed = Arc::new(AtomicU32::new(0));
        let signal = Arc::new(CompletionSignal::new());
        signal.reset(32);

        // Work enqueued before the thread exists is picked up at start.
        for _ in 0..32 {
            let executed = Arc::clone(&executed);
            worker.scheduler().enqueue_task(
                Task::new(move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                }),
                Some(Arc::clone(&signal)),
            );
        }

        worker.start(
            PoolKind::Generic,
            pool_id,
            Arc::clone(&hooks),
            "test-worker".into(),
            None,
        );
        worker.request_stop();
        worker.join();

        // Stop fully drains: nothing leaks across restarts.
        assert_eq!(executed.load(Ordering::SeqCst), 32);
        assert!(signal.is_completed());
        assert_eq!(worker.scheduler().num_enqueued(), 0);
    }
}

#[test]
fn worker_survives_panicking_task() {
    use crate::core::signal::CompletionSignal;
    use crate::core::task::Task;
    use crate::sync::{Arc, AtomicU32};

    let hooks = Arc::new(ThreadHooks { start: None, exit: None });
    let worker = WorkerThread::new(0);

    let signal = Arc::new(CompletionSignal::new());
    signal.reset(2);
    let executed = Arc::new(AtomicU32::new(0));

    worker.scheduler().enqueue_task(
        Task::new(|| panic!("task body failure")),
        Some(Arc::clone(&signal)),
    );
    let e = Arc::clone(&executed);
    worker.scheduler().enqueue_task(
        Task::new(move || {
            e.fetch_add(1, Ordering::SeqCst);
        }),
        Some(Arc::clone(&signal)),
    );

    worker.start(
        PoolKind::Generic,
        PoolId(u32::MAX),
        hooks,
        "test-worker".into(),
        None,
    );
    signal.wait();
    worker.request_stop();
    worker.join();

    // The panic was isolated and its completion still counted.
    assert_eq!(executed.load(Ordering::SeqCst), 1);
    assert!(signal.is_completed());
}
