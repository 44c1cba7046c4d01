//! Fixed worker pools and next-thread selection.
//!
//! A pool owns a fixed array of workers for its whole life and hands out
//! target threads through a shared round-robin cursor. Selection is the one
//! delicate piece: a worker thread scheduling back onto its own pool must
//! never be handed a target that would close a wait-for cycle, so candidates
//! are vetted and the search is strictly bounded.

use std::cell::Cell;

use crossbeam_utils::CachePadded;

use crate::sync::{Ordering, Arc, AtomicUsize, thread};

use super::worker::WorkerThread;
use super::ThreadHooks;

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_POOL_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// How many round-robin probes `next_task_thread` may spend before it
/// degrades to a fallback target.
pub(crate) const MAX_SELECTION_SPINS: u32 = 40;

/// The closed set of named pools.
///
/// Sizes and priorities are fixed when the task system is built; there is no
/// configuration surface past that point.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// General-purpose work.
    Generic,
    /// Work that must run on render-affine threads.
    Render,
    /// Low-priority background work (async loads, cleanup).
    Background,
}

/// Advisory OS priority for a pool's threads, surfaced to the worker start
/// hook where the embedder can apply it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkerPriority {
    Normal,
    Low,
}

impl PoolKind {
    pub const COUNT: usize = 3;

    pub fn all() -> [PoolKind; PoolKind::COUNT] {
        [PoolKind::Generic, PoolKind::Render, PoolKind::Background]
    }

    pub(crate) fn index(self) -> usize {
        match self {
            PoolKind::Generic => 0,
            PoolKind::Render => 1,
            PoolKind::Background => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PoolKind::Generic => "generic",
            PoolKind::Render => "render",
            PoolKind::Background => "background",
        }
    }

    pub fn default_threads(self) -> u32 {
        match self {
            PoolKind::Generic => 4,
            PoolKind::Render => 2,
            PoolKind::Background => 2,
        }
    }

    pub fn priority(self) -> WorkerPriority {
        match self {
            PoolKind::Background => WorkerPriority::Low,
            _ => WorkerPriority::Normal,
        }
    }
}

/// A unique ID per pool to sanity-check membership when several pools (or
/// several task systems) coexist in one process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) u32);

thread_local! {
    // Which pool and worker slot the current thread is, if it is a worker.
    static CURRENT_WORKER: Cell<Option<(PoolId, u32)>> = Cell::new(None);
}

pub(crate) fn register_current_worker(pool: PoolId, index: u32) {
    CURRENT_WORKER.with(|current| current.set(Some((pool, index))));
}

pub(crate) fn clear_current_worker() {
    CURRENT_WORKER.with(|current| current.set(None));
}

/// The calling thread's worker slot in the given pool, if it is a member.
pub(crate) fn current_member_index(pool: PoolId) -> Option<u32> {
    CURRENT_WORKER.with(|current| match current.get() {
        Some((id, index)) if id == pool => Some(index),
        _ => None,
    })
}

pub(crate) struct WorkerPool {
    kind: PoolKind,
    id: PoolId,
    workers: Vec<WorkerThread>,
    cursor: CachePadded<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(kind: PoolKind, num_threads: u32) -> Self {
        let num_threads = num_threads.max(1);
        WorkerPool {
            kind,
            id: PoolId(NEXT_POOL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)),
            workers: (0..num_threads).map(WorkerThread::new).collect(),
            cursor: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn num_threads(&self) -> u32 {
        self.workers.len() as u32
    }

    pub fn workers(&self) -> &[WorkerThread] {
        &self.workers
    }

    pub fn start(
        &self,
        hooks: &Arc<ThreadHooks>,
        name_handler: &(dyn Fn(PoolKind, u32) -> String + Send + Sync),
        stack_size: Option<usize>,
    ) {
        for worker in self.workers() {
            worker.start(
                self.kind,
                self.id,
                Arc::clone(hooks),
                name_handler(self.kind, worker.index()),
                stack_size,
            );
        }
    }

    pub fn request_stop(&self) {
        for worker in &self.workers {
            worker.request_stop();
        }
    }

    pub fn join_all(&self) {
        for worker in &self.workers {
            worker.join();
        }
    }

    /// Pick a target worker for a new task.
    ///
    /// Round-robin with two rejection rules when the caller is itself one of
    /// this pool's workers: never pick the caller, and never pick a worker
    /// that still holds unexecuted work enqueued *from* the caller (the seed
    /// of a mutual wait). The search is bounded; on exhaustion a member
    /// caller degrades to its own worker, which its loop drains once the
    /// current task returns, so selection always terminates and never closes
    /// a cross-thread cycle.
    pub fn next_task_thread(&self) -> &WorkerThread {
        profiling::scope!("next_task_thread");

        let num_workers = self.workers.len();
        let member = current_member_index(self.id);
        let caller = thread::current().id();

        let mut fallback: Option<&WorkerThread> = None;

        for spin in 0..MAX_SELECTION_SPINS {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % num_workers;
            let candidate = &self.workers[slot];

            if let Some(own) = member {
                if own == slot as u32 || candidate.scheduler().has_work_from(caller) {
                    continue;
                }
            }

            // Spend the first lap holding out for an idle worker; after
            // that, take whatever the cursor serves up.
            if (spin as usize) < num_workers && !candidate.is_free() {
                fallback = match fallback {
                    Some(best)
                        if best.scheduler().num_enqueued()
                            <= candidate.scheduler().num_enqueued() =>
                    {
                        Some(best)
                    }
                    _ => Some(candidate),
                };
                continue;
            }

            return candidate;
        }

        if let Some(own) = member {
            return &self.workers[own as usize];
        }

        tracing::warn!(
            pool = self.kind.label(),
            spins = MAX_SELECTION_SPINS,
            "next_task_thread exhausted its spin budget; picking the least loaded candidate"
        );

        fallback.unwrap_or(&self.workers[0])
    }
}

#[test]
fn selection_cycles_through_workers() {
    let pool = WorkerPool::new(PoolKind::Generic, 4);

    // From a non-member thread with idle-looking queues, selection is plain
    // round-robin and must visit every worker.
    let mut seen = [false; 4];
    for _ in 0..8 {
        let worker = pool.next_task_thread();
        seen[worker.index() as usize] = true;
    }
    assert_eq!(seen, [true; 4]);
}

#[test]
fn selection_degrades_to_self_for_lone_member() {
    let pool = WorkerPool::new(PoolKind::Generic, 1);

    // Pose as the pool's only worker: every candidate is the caller, so the
    // bounded spin must run out and hand back the caller's own worker
    // instead of looping forever.
    register_current_worker(pool.id(), 0);
    let worker = pool.next_task_thread();
    assert_eq!(worker.index(), 0);
    clear_current_worker();
}

#[test]
fn selection_avoids_workers_fed_by_the_caller() {
    use crate::core::task::Task;

    let pool = WorkerPool::new(PoolKind::Generic, 3);

    // Enqueue work into worker 1 from this thread, then pose as worker 0.
    // Worker 1 now holds unexecuted work of ours, so selection must keep
    // returning worker 2.
    pool.workers()[1].scheduler().enqueue_task(Task::new(|| {}), None);

    register_current_worker(pool.id(), 0);
    for _ in 0..16 {
        let worker = pool.next_task_thread();
        assert_eq!(worker.index(), 2);
    }
    clear_current_worker();
}
