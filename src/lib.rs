//! A thread-affine task scheduler and worker pool for engine workloads.
//!
//! Offloads units of work from producer threads (main/game/render) onto a
//! fixed set of long-lived worker threads, with batched, dependent and
//! chained work.
//!
//! What we want:
//! - Per-worker task inboxes: any thread enqueues, only the owner drains,
//!   tasks on one worker run in FIFO order.
//! - Fire-and-forget and await-completion submission, without ever blocking
//!   the enqueuing thread on submission itself.
//! - Workers may schedule work back onto their own pool without risking a
//!   self-deadlock (bounded thread selection that degrades to self-execution).
//! - Batches tracked by a single completion signal, chainable into pipelines
//!   that advance from the completion path rather than by polling.
//! - A small closed set of named pools (generic, render, background) of
//!   fixed size; no work-stealing, no dynamic scaling.

mod core;
mod batch;
mod system;
pub mod util;

pub use crate::batch::TaskBatch;
pub use crate::core::pool::{PoolKind, WorkerPriority};
pub use crate::core::signal::CompletionSignal;
pub use crate::core::task::{Task, TaskId, TaskRef};
pub use crate::core::sync;
pub use crate::core::WorkerHook;
pub use crate::system::{TaskSystem, TaskSystemBuilder};

pub use crossbeam_utils::CachePadded;
