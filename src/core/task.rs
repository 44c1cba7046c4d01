use crate::sync::{Arc, thread};

use super::scheduler::Scheduler;
use super::signal::CompletionSignal;

/// Identifies a task within its scheduler.
///
/// IDs are assigned from a per-scheduler monotonic counter at enqueue time
/// and are never reused for the lifetime of the scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

/// A single unit of work.
///
/// Tasks are consumed exactly once: either by executing on a worker thread
/// or by being cancelled before execution via `TaskRef::cancel`.
pub struct Task {
    body: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task { body: Box::new(body) }
    }

    pub(crate) fn execute(self) {
        (self.body)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("Task")
    }
}

/// What actually sits in a scheduler's queue.
pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub task: Task,
    /// Decremented exactly once when the task executes or is cancelled.
    pub signal: Option<Arc<CompletionSignal>>,
    /// The thread that enqueued the task. Thread selection uses this to
    /// avoid creating a mutual wait between two workers.
    pub initiator: thread::ThreadId,
}

/// A handle to a scheduled task, used for cancellation and queries.
///
/// The handle keeps the owning scheduler alive, so it remains safe to use
/// after the worker thread is torn down; `cancel` simply reports `false`
/// once the task is no longer in the queue.
#[derive(Clone)]
pub struct TaskRef {
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) id: TaskId,
}

impl TaskRef {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Attempt to remove the task before it executes.
    ///
    /// Returns true iff the task was still pending and was removed. A task
    /// that already executed, was already cancelled, or belongs to a
    /// scheduler that has been drained reports `false`.
    pub fn cancel(&self) -> bool {
        self.scheduler.dequeue(self.id)
    }

    /// Whether the task is still sitting in its scheduler's queue.
    ///
    /// Best-effort: the task may start executing right after this returns.
    pub fn is_pending(&self) -> bool {
        self.scheduler.has_task(self.id)
    }
}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskRef").field("id", &self.id).finish()
    }
}
