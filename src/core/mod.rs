pub mod pool;
pub mod scheduler;
pub mod signal;
pub mod task;
pub mod worker;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use pool::PoolKind;

/// A callback invoked on a worker thread as it starts or exits.
///
/// The start hook is where an embedder applies platform concerns such as OS
/// thread priority (`PoolKind::priority` is advisory data for exactly that).
pub trait WorkerHook: Send + Sync {
    fn run(&self, pool: PoolKind, worker_index: u32);
}

impl<F> WorkerHook for F where F: Fn(PoolKind, u32) + Send + Sync + 'static {
    fn run(&self, pool: PoolKind, worker_index: u32) { self(pool, worker_index) }
}

pub(crate) struct ThreadHooks {
    pub start: Option<Box<dyn WorkerHook>>,
    pub exit: Option<Box<dyn WorkerHook>>,
}
