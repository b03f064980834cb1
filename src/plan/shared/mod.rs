//! The shared heap: objects reachable from more than one execution context.
//!
//! Shared objects live in shared regions owned by `SHARED_HEAP_ID` and never refer to
//! local objects. Each local heap bump-allocates its shared objects into a private shared
//! allocation region that the shared heap admits into its old space when the region is
//! full, at the start of every shared cycle, and when the local heap goes away.
//!
//! Shared cycles trace from every heap's roots and cross sets. They run concurrently on the
//! daemon thread (see [`SharedHeap::start_concurrent_mark`]) or stop-the-world on a
//! requesting mutator (see [`SharedHeap::collect`]).

mod collect_set;
mod cycle;
mod daemon;
mod heap;

pub use self::heap::SharedHeap;

use crate::scheduler::WorkerPool;
use crate::util::options::Options;
use std::sync::{Arc, Mutex};

/// Where the shared heap is in its cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum SharedPhase {
    Idle,
    /// A cycle was requested and is picking its collect set.
    SelectingCollectSet,
    /// Marking runs alongside the mutators.
    ConcurrentMarking,
    /// Every mutator is stopped for the end of marking and the sweep.
    FinalMarkAndSweep,
}

lazy_static! {
    static ref SHARED_HEAP: Mutex<Option<Arc<SharedHeap>>> = Mutex::new(None);
}

/// Create the process-wide shared heap. Returns the existing instance if there is one.
pub fn initialize(options: Options, pool: Option<Arc<WorkerPool>>) -> Arc<SharedHeap> {
    let mut instance = SHARED_HEAP.lock().unwrap();
    match instance.as_ref() {
        Some(shared) => {
            debug!("Shared heap already initialized");
            shared.clone()
        }
        None => {
            let shared = SharedHeap::new(options, pool);
            *instance = Some(shared.clone());
            shared
        }
    }
}

/// The process-wide shared heap, if initialized.
pub fn instance() -> Option<Arc<SharedHeap>> {
    SHARED_HEAP.lock().unwrap().clone()
}

/// Drop the process-wide instance. Its memory is released once the last heap holding it
/// is gone.
pub fn destroy() {
    let shared = SHARED_HEAP.lock().unwrap().take();
    if shared.is_none() {
        warn!("Destroying a shared heap that was never initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{fixtures::small_options, serial_test};

    #[test]
    fn singleton_lifecycle() {
        serial_test(|| {
            let first = initialize(small_options(), None);
            let second = initialize(small_options(), None);
            assert!(Arc::ptr_eq(&first, &second));
            assert!(instance().is_some_and(|s| Arc::ptr_eq(&s, &first)));
            destroy();
            assert!(instance().is_none());
        })
    }
}
