//! isoheap is a garbage collector for managed runtimes that run many isolated execution
//! contexts in one process.
//!
//! Each context owns a [`Heap`](plan::heap::Heap) with a copying young generation and a
//! marked, swept and occasionally compacted old generation. Objects that contexts share
//! live in the process-wide [`SharedHeap`](plan::shared::SharedHeap), which is traced
//! concurrently on a daemon thread and collected either in full or partially, sweeping only
//! its sparsest regions. A [`WorkerPool`](scheduler::WorkerPool) runs the parallel phases
//! of both.
//!
//! The runtime plugs in through the [`VMBinding`](vm::VMBinding) trait and usually talks to
//! the collector through the [`memory_manager`] functions:
//!
//! 1. [`memory_manager::init`] starts the worker pool and the shared heap.
//! 2. [`memory_manager::create_heap`] creates a heap for each execution context.
//! 3. The context allocates with [`memory_manager::alloc`], stores references with
//!    [`memory_manager::write_field`] and polls [`memory_manager::safepoint_poll`].
//! 4. [`memory_manager::shutdown`] releases the process-wide state once every heap is gone.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod memory_manager;
pub mod plan;
pub mod policy;
pub mod scheduler;
pub mod util;
pub mod vm;

pub use crate::plan::heap::Heap;
pub use crate::plan::shared::SharedHeap;
pub use crate::plan::{Cycle, CycleSummary, GCKind, GCReason};
pub use crate::scheduler::WorkerPool;
pub use crate::util::alloc::{AllocationError, AllocationKind};
pub use crate::util::options::Options;
pub use crate::util::tagged::TaggedValue;
pub use crate::util::{Address, ObjectReference};
