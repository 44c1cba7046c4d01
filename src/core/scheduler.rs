//! The thread-affine task inbox.
//!
//! Every worker thread owns exactly one `Scheduler` for its entire life.
//! Any thread may enqueue into it or cancel a pending task by ID, but only
//! the owner thread drains it, and it drains the whole queue in one swap so
//! that tasks execute outside the lock.

use std::collections::VecDeque;

use crossbeam_utils::sync::Unparker;

use crate::sync::{Ordering, Arc, Mutex, AtomicU64, AtomicUsize, thread};
use crate::util::OwnerTag;

use super::signal::CompletionSignal;
use super::task::{QueuedTask, Task, TaskId};

pub struct Scheduler {
    queue: Mutex<VecDeque<QueuedTask>>,
    next_id: AtomicU64,
    // Approximate pending count, maintained under the queue lock but read
    // without it. Used to skip locking when the queue is empty and as a
    // load hint for thread selection.
    num_enqueued: AtomicUsize,
    owner: OwnerTag,
    // Wakes the owning worker when work arrives. Re-installed on each
    // start since the parker is consumed by the worker thread.
    unparker: Mutex<Option<Unparker>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Scheduler {
            queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            num_enqueued: AtomicUsize::new(0),
            owner: OwnerTag::new("scheduler"),
            unparker: Mutex::new(None),
        }
    }

    /// Push a task into the queue and wake the owning worker.
    ///
    /// Callable from any thread. If `signal` is provided it is decremented
    /// exactly once when the task executes or is cancelled.
    pub(crate) fn enqueue_task(
        &self,
        task: Task,
        signal: Option<Arc<CompletionSignal>>,
    ) -> TaskId {
        profiling::scope!("enqueue_task");

        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));

        {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(QueuedTask {
                id,
                task,
                signal,
                initiator: thread::current().id(),
            });
            self.num_enqueued.fetch_add(1, Ordering::Release);
        }

        self.wake();

        id
    }

    /// Attempt to remove a pending task before it executes.
    ///
    /// Returns true iff the task was found in the queue. The associated
    /// completion signal is decremented after the queue lock is released:
    /// completing a batch can enqueue a chained batch into any scheduler,
    /// including this one.
    pub(crate) fn dequeue(&self, id: TaskId) -> bool {
        let removed = {
            let mut queue = self.queue.lock().unwrap();
            let index = queue.iter().position(|entry| entry.id == id);
            let removed = index.and_then(|index| queue.remove(index));
            if removed.is_some() {
                self.num_enqueued.fetch_sub(1, Ordering::Release);
            }
            removed
        };

        match removed {
            Some(entry) => {
                if let Some(signal) = entry.signal {
                    signal.finish_one();
                }
                true
            }
            None => false,
        }
    }

    /// Atomically move every pending task into `out`, preserving FIFO order.
    ///
    /// Owner thread only; the drained tasks are executed outside the lock.
    pub(crate) fn accept_all(&self, out: &mut Vec<QueuedTask>) {
        self.owner.assert_current();

        if self.num_enqueued.load(Ordering::Acquire) == 0 {
            return;
        }

        profiling::scope!("accept_all");

        let mut queue = self.queue.lock().unwrap();
        out.extend(queue.drain(..));
        self.num_enqueued.store(0, Ordering::Release);
    }

    /// Approximate number of pending tasks (relaxed consistency).
    pub(crate) fn num_enqueued(&self) -> usize {
        self.num_enqueued.load(Ordering::Relaxed)
    }

    pub(crate) fn has_task(&self, id: TaskId) -> bool {
        if self.num_enqueued.load(Ordering::Acquire) == 0 {
            return false;
        }
        let queue = self.queue.lock().unwrap();
        queue.iter().any(|entry| entry.id == id)
    }

    /// Whether any pending task was enqueued from the given thread.
    ///
    /// Thread selection uses this to reject candidates that could form a
    /// mutual wait with the calling worker.
    pub(crate) fn has_work_from(&self, initiator: thread::ThreadId) -> bool {
        if self.num_enqueued.load(Ordering::Acquire) == 0 {
            return false;
        }
        let queue = self.queue.lock().unwrap();
        queue.iter().any(|entry| entry.initiator == initiator)
    }

    pub(crate) fn bind_owner(&self) {
        self.owner.bind();
    }

    pub(crate) fn release_owner(&self) {
        self.owner.release();
    }

    pub(crate) fn owner_thread(&self) -> Option<thread::ThreadId> {
        self.owner.get()
    }

    pub(crate) fn set_unparker(&self, unparker: Option<Unparker>) {
        *self.unparker.lock().unwrap() = unparker;
    }

    pub(crate) fn wake(&self) {
        if let Some(unparker) = &*self.unparker.lock().unwrap() {
            unparker.unpark();
        }
    }
}

#[test]
fn enqueue_dequeue_roundtrip() {
    let scheduler = Scheduler::new();

    let id = scheduler.enqueue_task(Task::new(|| {}), None);
    assert_eq!(scheduler.num_enqueued(), 1);
    assert!(scheduler.has_task(id));

    // Pending tasks can be cancelled exactly once.
    assert!(scheduler.dequeue(id));
    assert!(!scheduler.dequeue(id));
    assert!(!scheduler.has_task(id));
    assert_eq!(scheduler.num_enqueued(), 0);

    // An ID that never existed is a benign miss.
    assert!(!scheduler.dequeue(TaskId(9999)));
}

#[test]
fn accept_all_preserves_fifo_order() {
    use crate::sync::{Arc, Mutex};

    let scheduler = Arc::new(Scheduler::new());
    scheduler.bind_owner();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..16 {
        let order = Arc::clone(&order);
        scheduler.enqueue_task(
            Task::new(move || order.lock().unwrap().push(i)),
            None,
        );
    }

    let mut drained = Vec::new();
    scheduler.accept_all(&mut drained);
    assert_eq!(drained.len(), 16);
    assert_eq!(scheduler.num_enqueued(), 0);

    for entry in drained {
        entry.task.execute();
    }
    assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<i32>>());

    // Executed tasks are gone; dequeue reports false from now on.
    assert!(!scheduler.dequeue(TaskId(1)));
}

#[test]
fn dequeue_races_with_drain() {
    use crate::sync::Arc;

    // Cancellation and draining contend on the same lock; whichever wins,
    // every task is observed exactly once.
    for _ in 0..200 {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.bind_owner();

        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(scheduler.enqueue_task(Task::new(|| {}), None));
        }

        let s = Arc::clone(&scheduler);
        let canceller = std::thread::spawn(move || {
            ids.into_iter().filter(|id| s.dequeue(*id)).count()
        });

        let mut drained = Vec::new();
        scheduler.accept_all(&mut drained);

        let cancelled = canceller.join().unwrap();
        assert_eq!(cancelled + drained.len(), 8);
    }
}

#[test]
#[should_panic]
fn accept_all_from_non_owner_asserts() {
    use crate::sync::Arc;

    let scheduler = Arc::new(Scheduler::new());
    scheduler.bind_owner();
    scheduler.enqueue_task(Task::new(|| {}), None);

    let s = Arc::clone(&scheduler);
    std::thread::spawn(move || {
        let mut out = Vec::new();
        s.accept_all(&mut out);
    })
    .join()
    .unwrap();
}
