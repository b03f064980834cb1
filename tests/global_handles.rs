//! Global handles dropped by other threads while a cycle runs.

use isoheap::plan::heap::Heap;
use isoheap::plan::shared::SharedHeap;
use isoheap::vm::DefaultBinding;
use isoheap::{AllocationKind, GCKind, GCReason, Options, TaggedValue, WorkerPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const CYCLES: usize = 20;

#[test]
fn globals_dropped_during_shared_cycles() {
    let mut options = Options::default();
    options.threads = 2;
    options.concurrent_marking = false;
    let pool = Arc::new(WorkerPool::new(options.threads));
    let shared = SharedHeap::new(options.clone(), Some(pool.clone()));
    let heap = Heap::new(options, shared.clone(), Some(pool), Arc::new(DefaultBinding));
    let object = heap.allocate(16, AllocationKind::Shared);
    heap.write_field(object, 0, TaggedValue::from_int(42));
    let kept = shared.global(TaggedValue::from_object(object));

    let stop = Arc::new(AtomicBool::new(false));
    let churned = Arc::new(AtomicUsize::new(0));
    // Not a mutator: it never polls and is never stopped.
    let churner = {
        let (shared, stop, churned) = (shared.clone(), stop.clone(), churned.clone());
        let value = kept.get();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let handles: Vec<_> = (0..8).map(|_| shared.global(value)).collect();
                drop(handles);
                churned.fetch_add(8, Ordering::SeqCst);
            }
        })
    };
    for _ in 0..CYCLES {
        assert!(heap.collect(GCKind::SharedFull, GCReason::Explicit));
    }
    stop.store(true, Ordering::SeqCst);
    churner.join().unwrap();

    assert!(churned.load(Ordering::SeqCst) > 0);
    let storage = shared.handle_storage();
    assert_eq!(storage.retired_global_count(), 0);
    assert_eq!(storage.global_handle_count(), 1);
    assert_eq!(kept.object().unwrap().get_field(0), TaggedValue::from_int(42));
    let report = heap.verify();
    assert!(report.is_ok(), "{}", report);
}

#[test]
fn weak_globals_dropped_during_local_cycles() {
    let mut options = Options::default();
    options.threads = 2;
    let pool = Arc::new(WorkerPool::new(options.threads));
    let shared = SharedHeap::new(options.clone(), Some(pool.clone()));
    let heap = Heap::new(options, shared, Some(pool), Arc::new(DefaultBinding));
    let kept = heap.global(TaggedValue::from_object(heap.allocate(8, AllocationKind::Old)));

    let weaks: Vec<_> = (0..256).map(|_| heap.weak(kept.object().unwrap())).collect();
    let dropper = thread::spawn(move || drop(weaks));
    for _ in 0..CYCLES {
        assert!(heap.collect(GCKind::Old, GCReason::Explicit));
    }
    dropper.join().unwrap();
    assert!(heap.collect(GCKind::Young, GCReason::Explicit));
    assert_eq!(heap.handle_storage().retired_global_count(), 0);
    assert_eq!(heap.handle_storage().global_handle_count(), 1);
}
