//! Task batches.
//!
//! A batch is a set of tasks distributed across one pool and tracked by a
//! single completion signal. Batches can chain: when one completes, its
//! `next` batch is enqueued from within the completion path, forming a
//! pipeline without the original caller polling or blocking.

use std::mem;

use crate::core::pool::PoolKind;
use crate::core::signal::CompletionSignal;
use crate::core::task::{Task, TaskRef};
use crate::sync::{Arc, Mutex, thread};
use crate::system::TaskSystem;

type OnComplete = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskBatch {
    // Tasks owned by the batch until the next enqueue moves them into their
    // assigned schedulers. Additions while a cycle is in flight only take
    // effect on the next enqueue.
    pending: Mutex<Vec<Task>>,
    // Refs recorded by the most recent enqueue, for cancellation and the
    // await-side deadlock check.
    refs: Mutex<Vec<TaskRef>>,
    signal: Arc<CompletionSignal>,
    pool: Mutex<PoolKind>,
    next: Mutex<Option<Arc<TaskBatch>>>,
    on_complete: Mutex<Option<OnComplete>>,
}

impl TaskBatch {
    pub fn new() -> Arc<TaskBatch> {
        Arc::new(TaskBatch {
            pending: Mutex::new(Vec::new()),
            refs: Mutex::new(Vec::new()),
            signal: Arc::new(CompletionSignal::new()),
            pool: Mutex::new(PoolKind::Generic),
            next: Mutex::new(None),
            on_complete: Mutex::new(None),
        })
    }

    /// Append a task. Valid at any time, but tasks added while a cycle is
    /// in flight are only picked up by the next enqueue.
    pub fn add<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_task(Task::new(body));
    }

    pub fn add_task(&self, task: Task) {
        self.pending.lock().unwrap().push(task);
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Route this batch to a named pool (default: `Generic`).
    pub fn set_pool(&self, pool: PoolKind) {
        *self.pool.lock().unwrap() = pool;
    }

    pub fn pool(&self) -> PoolKind {
        *self.pool.lock().unwrap()
    }

    /// Chain a follow-up batch, enqueued automatically when this one
    /// completes.
    pub fn set_next(&self, next: Arc<TaskBatch>) {
        *self.next.lock().unwrap() = Some(next);
    }

    /// Install a callback fired exactly once when the batch completes.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_complete.lock().unwrap() = Some(Box::new(callback));
    }

    /// True iff every task of the last enqueued cycle has executed or been
    /// cancelled. A batch that was never enqueued reports completed.
    pub fn is_completed(&self) -> bool {
        self.signal.is_completed()
    }

    /// Block until the current cycle completes.
    ///
    /// Calling this from a worker thread that owns one of the schedulers
    /// this batch was assigned to would deadlock (that thread can never
    /// drain its own queue while blocked), so it is a fatal assertion.
    pub fn await_completion(&self) {
        let deadlock = {
            let refs = self.refs.lock().unwrap();
            let current = thread::current().id();
            refs.iter()
                .any(|task_ref| task_ref.scheduler.owner_thread() == Some(current))
        };
        assert!(
            !deadlock,
            "await_completion called from a worker thread this batch is scheduled on"
        );

        self.signal.wait();
    }

    /// Run every pending task synchronously on the calling thread,
    /// bypassing the scheduler entirely.
    pub fn force_execute(&self) {
        profiling::scope!("force_execute");

        let pending = mem::take(&mut *self.pending.lock().unwrap());
        for task in pending {
            task.execute();
        }
    }

    pub(crate) fn signal(&self) -> &Arc<CompletionSignal> {
        &self.signal
    }

    pub(crate) fn take_pending(&self) -> Vec<Task> {
        mem::take(&mut *self.pending.lock().unwrap())
    }

    pub(crate) fn set_refs(&self, refs: Vec<TaskRef>) {
        *self.refs.lock().unwrap() = refs;
    }

    pub(crate) fn task_refs(&self) -> Vec<TaskRef> {
        self.refs.lock().unwrap().clone()
    }

    /// The completion transition: fire the callback, then hand the chained
    /// batch to the facade. Runs on whichever thread performed the final
    /// completion event (or synchronously for empty batches).
    pub(crate) fn fire_completion(&self, system: &TaskSystem) {
        let callback = self.on_complete.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }

        let next = self.next.lock().unwrap().take();
        if let Some(next) = next {
            system.enqueue_batch(&next);
        }
    }
}

#[test]
fn batch_owns_tasks_until_enqueued() {
    use crate::sync::{AtomicU32, Ordering};

    let batch = TaskBatch::new();
    assert!(batch.is_completed());
    assert_eq!(batch.num_pending(), 0);

    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        batch.add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(batch.num_pending(), 4);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // Force-execute runs everything on this thread and clears the list.
    batch.force_execute();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
    assert_eq!(batch.num_pending(), 0);
    assert!(batch.is_completed());
}

#[test]
fn batch_routes_to_a_pool() {
    let batch = TaskBatch::new();
    assert_eq!(batch.pool(), PoolKind::Generic);

    batch.set_pool(PoolKind::Background);
    assert_eq!(batch.pool(), PoolKind::Background);
}
